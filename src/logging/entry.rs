//! Cloud Logging 结构化日志记录
//!
//! 输出格式遵循 Cloud Logging 对 stdout JSON 行的约定：`severity`、`message`、
//! `httpRequest` 以及 `logging.googleapis.com/*` 特殊字段会被提取为 LogEntry 的
//! 对应属性，其余字段进入 jsonPayload。

use super::severity::Severity;
use crate::error::AppResult;
use axum::extract::ConnectInfo;
use chrono::{DateTime, SecondsFormat, Utc};
use http::{Request, Version, header};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

pub const TRACE_ID_LABEL: &str = "trace_id";
pub const LOG_NAME_LABEL: &str = "log";

/// 与 Cloud Logging 特殊字段冲突的键，附加字段使用这些键时会被加上前缀
const RESERVED_KEYS: &[&str] = &["severity", "message", "timestamp", "httpRequest"];

/// 父日志代表整个请求，子日志是请求处理期间应用输出的每一条日志
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Parent,
    Child,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Cloud Logging `HttpRequest` 结构
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestLog {
    pub request_method: String,
    pub request_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<String>,
}

impl HttpRequestLog {
    /// 从请求头部提取请求信息，不读取请求体
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let headers = request.headers();
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };

        // 代理链中第一跳才是客户端地址
        let remote_ip = header_str(header::HeaderName::from_static("x-forwarded-for"))
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            });

        Self {
            request_method: request.method().to_string(),
            request_url: request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| request.uri().path().to_string()),
            request_size: Some(
                header_str(header::CONTENT_LENGTH)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            ),
            status: None,
            response_size: None,
            user_agent: header_str(header::USER_AGENT),
            remote_ip,
            referer: header_str(header::REFERER),
            protocol: Some(protocol_name(request.version()).to_string()),
            latency: None,
        }
    }
}

fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP",
    }
}

/// Cloud Logging 的 Duration 字符串格式，例如 `0.012345s`
pub fn format_latency(elapsed: Duration) -> String {
    format!("{}s", elapsed.as_secs_f64())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    #[serde(skip)]
    pub kind: EntryKind,
    pub severity: Severity,
    pub message: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "logging.googleapis.com/trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(rename = "logging.googleapis.com/spanId", skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(
        rename = "logging.googleapis.com/trace_sampled",
        skip_serializing_if = "Option::is_none"
    )]
    pub trace_sampled: Option<bool>,
    #[serde(rename = "logging.googleapis.com/labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(
        rename = "logging.googleapis.com/sourceLocation",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_location: Option<SourceLocation>,
    #[serde(rename = "httpRequest", skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequestLog>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn serialize_timestamp<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

impl LogEntry {
    pub fn new(kind: EntryKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            trace: None,
            span_id: None,
            trace_sampled: None,
            labels: BTreeMap::new(),
            source_location: None,
            http_request: None,
            fields: Map::new(),
        }
    }

    /// 写入附加字段，与特殊字段同名的键会加上 `field_` 前缀
    pub fn insert_field(&mut self, key: &str, value: Value) {
        let reserved = RESERVED_KEYS.contains(&key) || key.starts_with("logging.googleapis.com/");
        let key = if reserved {
            format!("field_{}", key)
        } else {
            key.to_string()
        };
        self.fields.insert(key, value);
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.labels.get(TRACE_ID_LABEL).map(String::as_str)
    }

    pub fn log_name(&self) -> Option<&str> {
        self.labels.get(LOG_NAME_LABEL).map(String::as_str)
    }

    pub fn is_parent(&self) -> bool {
        self.kind == EntryKind::Parent
    }

    pub fn to_json_line(&self) -> AppResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// JSON 序列化失败时的纯文本降级格式
    pub fn to_text_line(&self) -> String {
        format!(
            "{} {} [{}] {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.severity,
            self.trace_id().unwrap_or("-"),
            self.message.replace('\n', " ")
        )
    }
}
