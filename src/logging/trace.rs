//! 请求追踪上下文
//!
//! 从入站请求头中读取 Cloud Trace 的追踪 ID，没有时生成一个新的。

use http::HeaderMap;
use uuid::Uuid;

/// App Engine / Cloud Run 注入的追踪头
pub const CLOUD_TRACE_HEADER: &str = "x-cloud-trace-context";
/// W3C Trace Context 头
pub const TRACEPARENT_HEADER: &str = "traceparent";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: Option<String>,
    pub sampled: Option<bool>,
}

impl TraceContext {
    /// 生成新的追踪 ID（32 位小写十六进制，与 Cloud Trace 格式一致）
    pub fn generate() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: None,
            sampled: None,
        }
    }

    /// 从请求头提取追踪上下文，`X-Cloud-Trace-Context` 优先于 `traceparent`
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        header(CLOUD_TRACE_HEADER)
            .and_then(parse_cloud_trace_context)
            .or_else(|| header(TRACEPARENT_HEADER).and_then(parse_traceparent))
    }

    pub fn from_headers_or_generate(headers: &HeaderMap) -> Self {
        Self::from_headers(headers).unwrap_or_else(Self::generate)
    }
}

/// 解析 `TRACE_ID/SPAN_ID;o=OPTIONS`，只有 TRACE_ID 是必需的
pub fn parse_cloud_trace_context(value: &str) -> Option<TraceContext> {
    let (ids, options) = match value.split_once(';') {
        Some((ids, options)) => (ids, Some(options)),
        None => (value, None),
    };
    let (trace_id, span_id) = match ids.split_once('/') {
        Some((trace_id, span_id)) => (trace_id, Some(span_id)),
        None => (ids, None),
    };

    let trace_id = trace_id.trim();
    if trace_id.is_empty() {
        return None;
    }

    let span_id = span_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let sampled = options
        .and_then(|o| o.trim().strip_prefix("o="))
        .map(|flag| flag.trim() == "1");

    Some(TraceContext {
        trace_id: trace_id.to_string(),
        span_id,
        sampled,
    })
}

/// 解析 `00-<trace-id>-<parent-id>-<flags>`
pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    let is_hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex(version, 2) || !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2) {
        return None;
    }
    // 全零 ID 按规范视为无效
    if trace_id.chars().all(|c| c == '0') {
        return None;
    }

    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some(TraceContext {
        trace_id: trace_id.to_ascii_lowercase(),
        span_id: Some(span_id.to_ascii_lowercase()),
        sampled: Some(flags & 0x01 == 0x01),
    })
}

/// Cloud Logging 用于关联追踪的资源名，没有项目 ID 时返回 `None`
pub fn trace_resource(project: Option<&str>, trace_id: &str) -> Option<String> {
    project
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("projects/{}/traces/{}", p, trace_id))
}
