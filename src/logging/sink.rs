use super::entry::LogEntry;
use crate::error::AppResult;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// 请求日志的输出目标
///
/// 每个请求结束时调用一次，`entries` 中最后一条是父日志。
pub trait LogSink: Send + Sync + 'static {
    fn write_batch(&self, entries: &[LogEntry]) -> AppResult<()>;
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn write_batch(&self, entries: &[LogEntry]) -> AppResult<()> {
        (**self).write_batch(entries)
    }
}

/// 每行一个 JSON 对象，App Engine / Cloud Run 的日志代理会直接解析
pub struct JsonLineSink<W = fn() -> io::Stdout> {
    make_writer: W,
}

impl JsonLineSink {
    pub fn stdout() -> Self {
        Self {
            make_writer: io::stdout,
        }
    }
}

impl Default for JsonLineSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl<W> JsonLineSink<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    pub fn new(make_writer: W) -> Self {
        Self { make_writer }
    }
}

impl<W> LogSink for JsonLineSink<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    fn write_batch(&self, entries: &[LogEntry]) -> AppResult<()> {
        // 整批拼好后一次写出，避免与其他请求的输出交错
        let mut buf = String::new();
        for entry in entries {
            match entry.to_json_line() {
                Ok(line) => buf.push_str(&line),
                // 字段都已是 serde_json::Value，正常情况下不会走到这里
                Err(_) => buf.push_str(&entry.to_text_line()),
            }
        }

        let mut writer = self.make_writer.make_writer();
        writer.write_all(buf.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// 内存中的日志收集器，克隆后共享同一份记录
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn parents(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.is_parent())
            .cloned()
            .collect()
    }

    pub fn children(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.is_parent())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn write_batch(&self, entries: &[LogEntry]) -> AppResult<()> {
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }
}
