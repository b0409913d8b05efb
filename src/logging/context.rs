use super::entry::{
    EntryKind, HttpRequestLog, LOG_NAME_LABEL, LogEntry, SourceLocation, TRACE_ID_LABEL,
    format_latency,
};
use super::severity::Severity;
use super::trace::{TraceContext, trace_resource};
use crate::config::RequestLoggerConfig;
use http::{Request, StatusCode};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::Dispatch;

/// 请求的处理结果，用于生成父日志
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// 内部服务正常返回了响应（状态码可以是任意值）
    Response {
        status: StatusCode,
        response_size: Option<u64>,
    },
    /// 内部服务返回了 `Err`
    Failed { message: String },
    /// 内部服务 panic
    Panicked { message: String },
}

impl RequestOutcome {
    fn status(&self) -> StatusCode {
        match self {
            RequestOutcome::Response { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            RequestOutcome::Response { status, .. } => Severity::for_status(*status),
            _ => Severity::Error,
        }
    }
}

#[derive(Debug, Default)]
struct RequestState {
    child_count: usize,
    max_severity: Option<Severity>,
    children: Vec<LogEntry>,
    finished: bool,
}

/// 单个请求的日志上下文
///
/// 由中间件在请求开始时创建，请求结束时通过 [`RequestContext::finish`]
/// 产出本请求的全部日志（子日志 + 一条父日志）。
#[derive(Debug)]
pub struct RequestContext {
    trace: TraceContext,
    trace_resource: Option<String>,
    request: HttpRequestLog,
    labels: BTreeMap<String, String>,
    log_name: String,
    child_log_name: String,
    started_at: Instant,
    state: Mutex<RequestState>,
    /// 子日志同时转发给的 dispatcher（请求开始前的默认 dispatcher）
    forward: Option<Dispatch>,
}

impl RequestContext {
    pub fn new<B>(request: &Request<B>, config: &RequestLoggerConfig) -> Self {
        let trace = TraceContext::from_headers_or_generate(request.headers());
        Self::with_trace(trace, HttpRequestLog::from_request(request), config)
    }

    pub fn with_trace(
        trace: TraceContext,
        request: HttpRequestLog,
        config: &RequestLoggerConfig,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(TRACE_ID_LABEL.to_string(), trace.trace_id.clone());
        // 对应 gae_app 资源的标签，未配置的直接省略
        for (key, value) in [
            ("project_id", &config.project),
            ("module_id", &config.module),
            ("version_id", &config.version),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                labels.insert(key.to_string(), value.to_string());
            }
        }

        Self {
            trace_resource: trace_resource(config.project.as_deref(), &trace.trace_id),
            trace,
            request,
            labels,
            log_name: config.log_name.clone(),
            child_log_name: config.child_log_name(),
            started_at: Instant::now(),
            state: Mutex::new(RequestState::default()),
            forward: None,
        }
    }

    pub fn forward_to(mut self, dispatch: Dispatch) -> Self {
        self.forward = Some(dispatch);
        self
    }

    pub fn forward(&self) -> Option<&Dispatch> {
        self.forward.as_ref()
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    /// `projects/<project>/traces/<trace_id>`，未配置项目时为 `None`
    pub fn trace_resource(&self) -> Option<&str> {
        self.trace_resource.as_deref()
    }

    pub fn request(&self) -> &HttpRequestLog {
        &self.request
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().child_count
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.state.lock().max_severity
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn entry(&self, kind: EntryKind, severity: Severity, message: String) -> LogEntry {
        let mut entry = LogEntry::new(kind, severity, message);
        entry.trace = self.trace_resource.clone();
        entry.span_id = self.trace.span_id.clone();
        entry.trace_sampled = self.trace.sampled;
        entry.labels = self.labels.clone();
        let log_name = match kind {
            EntryKind::Parent => &self.log_name,
            EntryKind::Child => &self.child_log_name,
        };
        entry
            .labels
            .insert(LOG_NAME_LABEL.to_string(), log_name.clone());
        entry
    }

    /// 记录一条子日志
    pub fn record_child(
        &self,
        severity: Severity,
        message: String,
        fields: Map<String, Value>,
        source: Option<SourceLocation>,
    ) {
        let mut entry = self.entry(EntryKind::Child, severity, message);
        entry.source_location = source;
        for (key, value) in fields {
            entry.insert_field(&key, value);
        }

        let mut state = self.state.lock();
        if state.finished {
            // 请求已经提交，迟到的日志不再归属于它
            return;
        }
        state.child_count += 1;
        state.max_severity = state.max_severity.max(Some(severity));
        state.children.push(entry);
    }

    /// 结束请求，返回待提交的日志：先是全部子日志，最后是唯一的父日志
    ///
    /// 重复调用只会返回空列表。
    pub fn finish(&self, outcome: RequestOutcome) -> Vec<LogEntry> {
        let mut state = self.state.lock();
        if state.finished {
            return Vec::new();
        }
        state.finished = true;

        let status = outcome.status();
        let severity = state
            .max_severity
            .unwrap_or_default()
            .max(outcome.severity());

        let mut http_request = self.request.clone();
        http_request.status = Some(status.as_u16());
        http_request.latency = Some(format_latency(self.elapsed()));
        if let RequestOutcome::Response { response_size, .. } = &outcome {
            http_request.response_size = *response_size;
        }

        let message = format!(
            "{} {} {}",
            http_request.request_method,
            http_request.request_url,
            status.as_u16()
        );
        let mut parent = self.entry(EntryKind::Parent, severity, message);
        parent.insert_field("childCount", json!(state.child_count));
        match &outcome {
            RequestOutcome::Failed { message } => parent.insert_field("error", json!(message)),
            RequestOutcome::Panicked { message } => {
                parent.insert_field("error", json!(message));
                parent.insert_field("panicked", json!(true));
            }
            RequestOutcome::Response { .. } => {}
        }
        parent.http_request = Some(http_request);

        let mut entries = std::mem::take(&mut state.children);
        entries.push(parent);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(config: &RequestLoggerConfig) -> RequestContext {
        let request = Request::builder()
            .method("GET")
            .uri("/hello?x=1")
            .header("x-cloud-trace-context", "feedbeef/5;o=1")
            .body(())
            .unwrap();
        RequestContext::new(&request, config)
    }

    fn config() -> RequestLoggerConfig {
        RequestLoggerConfig::default()
            .project("demo-project")
            .module("default")
            .version("v1")
    }

    #[test]
    fn test_context_reads_inbound_trace() {
        let ctx = context(&config());
        assert_eq!(ctx.trace_id(), "feedbeef");
        assert_eq!(ctx.trace_resource(), Some("projects/demo-project/traces/feedbeef"));
        assert_eq!(ctx.request().request_url, "/hello?x=1");
        assert_eq!(ctx.child_count(), 0);
    }

    #[test]
    fn test_children_share_trace_with_parent() {
        let ctx = context(&config());
        ctx.record_child(Severity::Warning, "first".into(), Map::new(), None);
        ctx.record_child(Severity::Error, "second".into(), Map::new(), None);
        assert_eq!(ctx.child_count(), 2);
        assert_eq!(ctx.max_severity(), Some(Severity::Error));

        let entries = ctx.finish(RequestOutcome::Response {
            status: StatusCode::OK,
            response_size: Some(5),
        });
        assert_eq!(entries.len(), 3);
        assert!(entries[..2].iter().all(|e| e.kind == EntryKind::Child));
        assert!(entries.iter().all(|e| e.trace_id() == Some("feedbeef")));
        assert!(entries.iter().all(|e| e.span_id.as_deref() == Some("5")));

        let parent = &entries[2];
        assert!(parent.is_parent());
        assert_eq!(parent.severity, Severity::Error);
        assert_eq!(parent.log_name(), Some("app"));
        assert_eq!(entries[0].log_name(), Some("app_child"));
        assert_eq!(parent.fields["childCount"], 2);
        let http = parent.http_request.as_ref().unwrap();
        assert_eq!(http.status, Some(200));
        assert_eq!(http.response_size, Some(5));
        assert!(http.latency.as_deref().unwrap().ends_with('s'));
    }

    #[test]
    fn test_parent_severity_follows_status() {
        let ctx = context(&config());
        let entries = ctx.finish(RequestOutcome::Response {
            status: StatusCode::NOT_FOUND,
            response_size: None,
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Warning);
        assert_eq!(entries[0].message, "GET /hello?x=1 404");
    }

    #[test]
    fn test_failed_outcome_is_error() {
        let ctx = context(&config());
        ctx.record_child(Severity::Debug, "noise".into(), Map::new(), None);
        let entries = ctx.finish(RequestOutcome::Failed {
            message: "boom".to_string(),
        });
        let parent = entries.last().unwrap();
        assert_eq!(parent.severity, Severity::Error);
        assert_eq!(parent.fields["error"], "boom");
        assert_eq!(parent.http_request.as_ref().unwrap().status, Some(500));
    }

    #[test]
    fn test_finish_only_once() {
        let ctx = context(&config());
        let outcome = RequestOutcome::Panicked {
            message: "oops".to_string(),
        };
        assert_eq!(ctx.finish(outcome.clone()).len(), 1);
        assert!(ctx.finish(outcome).is_empty());

        ctx.record_child(Severity::Info, "late".into(), Map::new(), None);
        assert_eq!(ctx.child_count(), 0);
    }

    #[test]
    fn test_missing_project_omits_trace_resource() {
        let ctx = context(&RequestLoggerConfig::default());
        assert_eq!(ctx.trace_resource(), None);

        let entries = ctx.finish(RequestOutcome::Response {
            status: StatusCode::OK,
            response_size: None,
        });
        let parent = &entries[0];
        assert_eq!(parent.trace, None);
        assert_eq!(parent.trace_id(), Some("feedbeef"));
        assert!(!parent.labels.contains_key("project_id"));
        assert_eq!(parent.severity, Severity::Info);
    }
}
