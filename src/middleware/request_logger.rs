//! 请求日志关联中间件
//!
//! 为每个请求建立独立的日志作用域：请求处理期间产生的 tracing 事件都被记为
//! 该请求的子日志并带上同一个追踪 ID，请求结束后再输出一条汇总的父日志，
//! Cloud Logging 会把两者折叠显示为一条请求记录。

use crate::config::RequestLoggerConfig;
use crate::logging::{
    JsonLineSink, LogSink, REQUEST_SPAN, RequestContext, RequestLogLayer, RequestOutcome,
};
use axum::body::HttpBody;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode, header};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span};
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::{LookupSpan, Registry};

/// 客户端在响应完成前断开连接（沿用 nginx 的 499）
const CLIENT_CLOSED_REQUEST: u16 = 499;

struct Shared {
    config: RequestLoggerConfig,
    /// 请求作用域内生效的 dispatcher，每次 poll 内部服务时临时设为默认
    dispatch: Dispatch,
    sink: Arc<dyn LogSink>,
}

impl Shared {
    fn new(config: RequestLoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        let max_level = config.loglevel.level_filter();
        // 过滤只作用于事件，请求 span 必须始终存在
        let filter = filter_fn(move |metadata| metadata.is_span() || *metadata.level() <= max_level);
        let subscriber = Registry::default().with(RequestLogLayer.with_filter(filter));

        Self {
            config,
            dispatch: Dispatch::new(subscriber),
            sink,
        }
    }

    /// 在请求 dispatcher 中创建根 span，并把请求上下文挂到 span 上
    fn request_span(&self, context: &Arc<RequestContext>) -> Span {
        tracing::dispatcher::with_default(&self.dispatch, || {
            let span = tracing::info_span!(
                parent: None,
                REQUEST_SPAN,
                trace_id = %context.trace_id(),
            );
            Span::with_subscriber(&span, |(id, dispatch)| {
                if let Some(registry) = dispatch.downcast_ref::<Registry>() {
                    if let Some(span) = registry.span(id) {
                        span.extensions_mut().insert(context.clone());
                    }
                }
            });
            span
        })
    }

    fn commit(&self, context: &RequestContext, outcome: RequestOutcome) {
        let entries = context.finish(outcome);
        if entries.is_empty() {
            return;
        }

        // 此时已回到进程原有的 dispatcher，这条日志不属于任何请求
        if let Err(e) = self.sink.write_batch(&entries) {
            tracing::warn!(
                trace_id = %context.trace_id(),
                error = %e,
                "Failed to write request logs"
            );
        }
    }
}

/// 请求未走到正常结束（future 被丢弃）时补写父日志
struct CommitOnDrop {
    shared: Arc<Shared>,
    context: Arc<RequestContext>,
}

impl Drop for CommitOnDrop {
    fn drop(&mut self) {
        let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.shared.commit(
            &self.context,
            RequestOutcome::Response {
                status,
                response_size: None,
            },
        );
    }
}

/// 请求日志中间件的 tower Layer
///
/// ```ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(RequestLoggerLayer::new(config.request_logger()));
/// ```
#[derive(Clone)]
pub struct RequestLoggerLayer {
    shared: Arc<Shared>,
}

impl RequestLoggerLayer {
    /// 输出到 stdout
    pub fn new(config: RequestLoggerConfig) -> Self {
        Self::with_sink(config, JsonLineSink::stdout())
    }

    pub fn with_sink(config: RequestLoggerConfig, sink: impl LogSink) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, Arc::new(sink))),
        }
    }

    pub fn config(&self) -> &RequestLoggerConfig {
        &self.shared.config
    }
}

impl fmt::Debug for RequestLoggerLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLoggerLayer")
            .field("config", &self.shared.config)
            .finish()
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLogger<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogger {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// 包装任意 HTTP 服务，请求与响应原样透传
#[derive(Clone)]
pub struct RequestLogger<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> RequestLogger<S> {
    pub fn new(inner: S, config: RequestLoggerConfig) -> Self {
        RequestLoggerLayer::new(config).layer(inner)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestLogger<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ResBody: HttpBody + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut context = RequestContext::new(&request, &self.shared.config);
        if self.shared.config.forward_events {
            context = context.forward_to(tracing::dispatcher::get_default(Dispatch::clone));
        }
        let context = Arc::new(context);
        let span = self.shared.request_span(&context);
        let dispatch = self.shared.dispatch.clone();
        let guard = CommitOnDrop {
            shared: self.shared.clone(),
            context: context.clone(),
        };

        // inner.call 中同步执行的部分同样属于本请求
        let inner = &mut self.inner;
        let called = panic::catch_unwind(AssertUnwindSafe(|| {
            tracing::dispatcher::with_default(&dispatch, || span.in_scope(|| inner.call(request)))
        }));
        let future = match called {
            Ok(future) => future,
            Err(payload) => {
                guard.shared.commit(
                    &context,
                    RequestOutcome::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                );
                panic::resume_unwind(payload);
            }
        };

        Box::pin(async move {
            let result = AssertUnwindSafe(future.instrument(span).with_subscriber(dispatch))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(response)) => {
                    let outcome = RequestOutcome::Response {
                        status: response.status(),
                        response_size: response_size(&response),
                    };
                    guard.shared.commit(&context, outcome);
                    Ok(response)
                }
                Ok(Err(e)) => {
                    let outcome = RequestOutcome::Failed {
                        message: e.to_string(),
                    };
                    guard.shared.commit(&context, outcome);
                    Err(e)
                }
                Err(payload) => {
                    let outcome = RequestOutcome::Panicked {
                        message: panic_message(payload.as_ref()),
                    };
                    guard.shared.commit(&context, outcome);
                    panic::resume_unwind(payload)
                }
            }
        })
    }
}

/// 优先取 `Content-Length`，否则使用响应体给出的确切长度
fn response_size<B: HttpBody>(response: &Response<B>) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| response.body().size_hint().exact())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}
