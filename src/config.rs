use crate::error::{AppError, AppResult};
use crate::logging::Severity;
use serde::Deserialize;

/// 进程配置，全部来自环境变量（以及可选的 `.env` 文件）
///
/// App Engine 会自动注入 `GOOGLE_CLOUD_PROJECT`、`GAE_SERVICE`、`GAE_VERSION`。
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub google_cloud_project: Option<String>,
    #[serde(default)]
    pub gae_service: Option<String>,
    #[serde(default)]
    pub gae_version: Option<String>,

    #[serde(default = "default_log_name")]
    pub log_name: String,
    #[serde(default)]
    pub child_log_name: Option<String>,

    /// 请求内的日志是否同时交给进程级 subscriber（本地开发时方便在终端查看）
    #[serde(default)]
    pub forward_request_events: bool,
}

/// 请求日志中间件的构造参数
///
/// 缺省的 project / module / version 只会让对应字段被省略，不会报错。
#[derive(Clone, Debug)]
pub struct RequestLoggerConfig {
    /// 子日志的最低级别
    pub loglevel: Severity,
    pub project: Option<String>,
    pub module: Option<String>,
    pub version: Option<String>,
    /// 父日志的日志名
    pub log_name: String,
    /// 子日志的日志名，缺省为 `<log_name>_child`
    ///
    /// 父子日志名必须不同，日志查看器才能把它们关联起来。
    pub child_log_name: Option<String>,
    /// 子日志同时转发给请求开始前的默认 dispatcher
    pub forward_events: bool,
}

impl Default for RequestLoggerConfig {
    fn default() -> Self {
        Self {
            loglevel: Severity::Info,
            project: None,
            module: None,
            version: None,
            log_name: default_log_name(),
            child_log_name: None,
            forward_events: false,
        }
    }
}

impl RequestLoggerConfig {
    pub fn loglevel(mut self, loglevel: Severity) -> Self {
        self.loglevel = loglevel;
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn log_name(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = log_name.into();
        self
    }

    pub fn with_child_log_name(mut self, child_log_name: impl Into<String>) -> Self {
        self.child_log_name = Some(child_log_name.into());
        self
    }

    pub fn forward_events(mut self, forward_events: bool) -> Self {
        self.forward_events = forward_events;
        self
    }

    pub fn child_log_name(&self) -> String {
        self.child_log_name
            .clone()
            .unwrap_or_else(|| format!("{}_child", self.log_name))
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_name() -> String {
    "app".to_string()
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::from_iter::<_, Config>(vars)
            .map_err(|e| AppError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        self.log_level.parse::<Severity>()?;

        if !matches!(self.log_format.as_str(), "json" | "text") {
            return Err(AppError::Config(
                "LOG_FORMAT must be either json or text".to_string(),
            ));
        }

        if self.log_name.trim().is_empty() {
            return Err(AppError::Config("LOG_NAME must not be empty".to_string()));
        }

        if self.child_log_name.as_deref() == Some(self.log_name.as_str()) {
            return Err(AppError::Config(
                "CHILD_LOG_NAME must differ from LOG_NAME".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.port)
    }

    pub fn severity(&self) -> Severity {
        self.log_level.parse().unwrap_or(Severity::Info)
    }

    pub fn request_logger(&self) -> RequestLoggerConfig {
        RequestLoggerConfig {
            loglevel: self.severity(),
            project: self.google_cloud_project.clone(),
            module: self.gae_service.clone(),
            version: self.gae_version.clone(),
            log_name: self.log_name.clone(),
            child_log_name: self.child_log_name.clone(),
            forward_events: self.forward_request_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_vars(vars(&[])).unwrap();
        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert_eq!(config.severity(), Severity::Info);
        assert_eq!(config.log_format, "json");

        let logger = config.request_logger();
        assert_eq!(logger.project, None);
        assert_eq!(logger.log_name, "app");
        assert_eq!(logger.child_log_name(), "app_child");
        assert!(!logger.forward_events);
    }

    #[test]
    fn test_config_reads_app_engine_variables() {
        let config = Config::from_vars(vars(&[
            ("GOOGLE_CLOUD_PROJECT", "demo-project"),
            ("GAE_SERVICE", "api"),
            ("GAE_VERSION", "20261018t120000"),
            ("LOG_LEVEL", "warning"),
            ("PORT", "9000"),
            ("CHILD_LOG_NAME", "requests"),
            ("FORWARD_REQUEST_EVENTS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        let logger = config.request_logger();
        assert_eq!(logger.project.as_deref(), Some("demo-project"));
        assert_eq!(logger.module.as_deref(), Some("api"));
        assert_eq!(logger.version.as_deref(), Some("20261018t120000"));
        assert_eq!(logger.loglevel, Severity::Warning);
        assert_eq!(logger.child_log_name(), "requests");
        assert!(logger.forward_events);
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::from_vars(vars(&[("LOG_LEVEL", "loud")])).is_err());
        assert!(Config::from_vars(vars(&[("LOG_FORMAT", "xml")])).is_err());
        assert!(Config::from_vars(vars(&[("PORT", "not-a-port")])).is_err());
        assert!(Config::from_vars(vars(&[("CHILD_LOG_NAME", "app")])).is_err());
    }

    #[test]
    fn test_request_logger_builder() {
        let config = RequestLoggerConfig::default()
            .loglevel(Severity::Debug)
            .project("p")
            .module("m")
            .version("v")
            .log_name("web");
        assert_eq!(config.loglevel, Severity::Debug);
        assert_eq!(config.child_log_name(), "web_child");
        assert_eq!(
            config.with_child_log_name("web_lines").child_log_name(),
            "web_lines"
        );
    }
}
