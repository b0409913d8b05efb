pub mod context;
pub mod entry;
pub mod layer;
pub mod severity;
pub mod sink;
pub mod trace;

pub use context::{RequestContext, RequestOutcome};
pub use entry::{EntryKind, HttpRequestLog, LogEntry, SourceLocation};
pub use layer::{REQUEST_SPAN, RequestLogLayer};
pub use severity::Severity;
pub use sink::{JsonLineSink, LogSink, MemorySink};
pub use trace::TraceContext;
