pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;

pub use config::{Config, RequestLoggerConfig};
pub use error::{AppError, AppResult};
pub use logging::{LogEntry, LogSink, MemorySink, Severity};
pub use middleware::{RequestLogger, RequestLoggerLayer};

use tracing_subscriber::EnvFilter;

/// 初始化进程级别的日志（请求之外的日志走这里）
pub fn init_tracing(config: &Config) {
    let level_filter = match config.log_level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter));

    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
