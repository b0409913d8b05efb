//! 把请求处理期间的 tracing 事件转换为子日志的 Layer

use super::context::RequestContext;
use super::entry::SourceLocation;
use super::severity::Severity;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// 中间件为每个请求创建的根 span 名称
pub const REQUEST_SPAN: &str = "request";

/// 子日志 Layer
///
/// 只处理落在请求 span 内的事件：沿 span 链找到挂在请求 span 上的
/// [`RequestContext`]，把事件记为该请求的子日志。请求之外的事件直接忽略。
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestLogLayer;

impl<S> Layer<S> for RequestLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(request) = find_request_context(&ctx, event) else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let source = metadata.file().map(|file| SourceLocation {
            file: file.to_string(),
            line: metadata.line(),
            function: metadata.module_path().map(str::to_string),
        });

        // 用户自己的 `target` 字段优先
        let mut fields = visitor.fields;
        fields
            .entry("target")
            .or_insert_with(|| Value::String(metadata.target().to_string()));

        request.record_child(
            Severity::from(*metadata.level()),
            visitor.message.unwrap_or_default(),
            fields,
            source,
        );

        if let Some(forward) = request.forward() {
            if forward.enabled(metadata) {
                forward.event(event);
            }
        }
    }
}

fn find_request_context<S>(ctx: &Context<'_, S>, event: &Event<'_>) -> Option<Arc<RequestContext>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    ctx.event_scope(event)?.from_root().find_map(|span| {
        let extensions = span.extensions();
        extensions.get::<Arc<RequestContext>>().cloned()
    })
}

/// 收集事件字段，`message` 单独提出，其余转为 JSON 值
#[derive(Debug, Default)]
pub struct FieldVisitor {
    pub message: Option<String>,
    pub fields: Map<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        // tracing-log 桥接附带的元数据字段
        if field.name().starts_with("log.") {
            return;
        }
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN 和无穷大无法表示为 JSON 数字，退化为字符串
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.insert(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestLoggerConfig;
    use crate::logging::context::RequestOutcome;
    use http::{Request, StatusCode};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::registry::Registry;

    fn attach(span: &tracing::Span, request: Arc<RequestContext>) {
        span.with_subscriber(|(id, dispatch)| {
            let registry = dispatch.downcast_ref::<Registry>().unwrap();
            registry.span(id).unwrap().extensions_mut().insert(request);
        });
    }

    #[test]
    fn test_events_inside_request_span_become_children() {
        let subscriber = Registry::default().with(RequestLogLayer);
        let request = Request::builder().uri("/").body(()).unwrap();
        let ctx = Arc::new(RequestContext::new(&request, &RequestLoggerConfig::default()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any request");

            let span = tracing::info_span!(REQUEST_SPAN);
            attach(&span, ctx.clone());
            span.in_scope(|| {
                tracing::warn!(user = "alice", attempts = 3u64, ratio = f64::NAN, "login slow");
                let inner = tracing::debug_span!("db");
                inner.in_scope(|| tracing::error!(error = "timeout", "query failed"));
            });
        });

        assert_eq!(ctx.child_count(), 2);
        let entries = ctx.finish(RequestOutcome::Response {
            status: StatusCode::OK,
            response_size: None,
        });
        let first = &entries[0];
        assert_eq!(first.message, "login slow");
        assert_eq!(first.severity, Severity::Warning);
        assert_eq!(first.fields["user"], "alice");
        assert_eq!(first.fields["attempts"], 3);
        assert_eq!(first.fields["ratio"], "NaN");
        assert!(first.source_location.as_ref().unwrap().file.ends_with("layer.rs"));

        let second = &entries[1];
        assert_eq!(second.message, "query failed");
        assert_eq!(second.fields["error"], "timeout");
        assert_eq!(entries[2].severity, Severity::Error);
    }

    #[test]
    fn test_user_target_field_is_kept() {
        let subscriber = Registry::default().with(RequestLogLayer);
        let request = Request::builder().uri("/").body(()).unwrap();
        let ctx = Arc::new(RequestContext::new(&request, &RequestLoggerConfig::default()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(REQUEST_SPAN);
            attach(&span, ctx.clone());
            span.in_scope(|| {
                tracing::info!(target = "checkout", "order placed");
                tracing::info!("no target field");
            });
        });

        let entries = ctx.finish(RequestOutcome::Response {
            status: StatusCode::OK,
            response_size: None,
        });
        assert_eq!(entries[0].fields["target"], "checkout");
        assert_eq!(entries[1].fields["target"], module_path!());
    }

    #[test]
    fn test_events_without_request_span_are_ignored() {
        let subscriber = Registry::default().with(RequestLogLayer);
        let request = Request::builder().uri("/").body(()).unwrap();
        let ctx = Arc::new(RequestContext::new(&request, &RequestLoggerConfig::default()));

        tracing::subscriber::with_default(subscriber, || {
            let unrelated = tracing::info_span!("background");
            unrelated.in_scope(|| tracing::error!("not part of a request"));
        });

        assert_eq!(ctx.child_count(), 0);
    }
}
