use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::errors::AppResult;

const DEFAULT_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub name: String,
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RunEvent {
    fn new(level: EventLevel, name: String, payload: Value) -> Self {
        Self {
            name,
            level,
            timestamp: Utc::now(),
            payload,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &RunEvent) -> AppResult<()>;

    fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Handle passed to every component that reports progress or failures.
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Telemetry {
    /// Telemetry that only forwards to `tracing`.
    pub fn tracing() -> Self {
        Self::default().with_sink(Arc::new(TracingSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn debug(&self, name: &str, payload: Value) {
        self.emit(EventLevel::Debug, name, payload);
    }

    pub fn info(&self, name: &str, payload: Value) {
        self.emit(EventLevel::Info, name, payload);
    }

    pub fn warn(&self, name: &str, payload: Value) {
        self.emit(EventLevel::Warn, name, payload);
    }

    pub fn error(&self, name: &str, payload: Value) {
        self.emit(EventLevel::Error, name, payload);
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            if let Err(err) = sink.flush() {
                warn!(?err, "failed to flush run events");
            }
        }
    }

    fn emit(&self, level: EventLevel, name: &str, payload: Value) {
        if self.sinks.is_empty() {
            return;
        }
        let event = RunEvent::new(level, name.to_string(), payload);
        for sink in &self.sinks {
            if let Err(err) = sink.record(&event) {
                warn!(?err, event = %event.name, "failed to record run event");
            }
        }
    }
}

pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &RunEvent) -> AppResult<()> {
        let name = event.name.as_str();
        let payload = &event.payload;
        match event.level {
            EventLevel::Debug => debug!(event = name, %payload),
            EventLevel::Info => info!(event = name, %payload),
            EventLevel::Warn => warn!(event = name, %payload),
            EventLevel::Error => error!(event = name, %payload),
        }
        Ok(())
    }
}

/// Buffers events and appends them to a JSON Lines file in batches.
pub struct JsonlSink {
    queue: Mutex<Vec<RunEvent>>,
    path: PathBuf,
    batch_size: usize,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::with_batch_size(path, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size<P: AsRef<Path>>(path: P, batch_size: usize) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            queue: Mutex::new(Vec::new()),
            path,
            batch_size: batch_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn persist_locked(&self, queue: &mut Vec<RunEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(queue.len());
        for event in queue.iter() {
            encoded.push(serde_json::to_vec(event)?);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn record(&self, event: &RunEvent) -> AppResult<()> {
        let mut queue = self.queue.lock();
        queue.push(event.clone());
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }
}

/// Keeps every event in memory. Useful for asserting on what a run reported.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &RunEvent) -> AppResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn fans_out_to_every_sink() {
        let memory = Arc::new(MemorySink::default());
        let telemetry = Telemetry::tracing().with_sink(memory.clone());

        telemetry.info("query_started", json!({ "keyword": "cafe bandung" }));
        telemetry.warn("geocode_failed", json!({}));

        let events = memory.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, EventLevel::Info);
        assert_eq!(events[1].name, "geocode_failed");
    }

    #[test]
    fn jsonl_sink_buffers_until_batch_size() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(JsonlSink::with_batch_size(dir.path().join("events.jsonl"), 2).unwrap());
        let telemetry = Telemetry::default().with_sink(sink.clone());

        telemetry.info("first", json!({}));
        assert_eq!(sink.queue_depth(), 1);
        telemetry.info("second", json!({}));
        assert_eq!(sink.queue_depth(), 0);

        telemetry.info("third", json!({}));
        telemetry.flush();

        let buffer = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(buffer.lines().count(), 3);
        assert!(buffer.contains("\"third\""));
    }

    #[test]
    fn keeps_log_across_sink_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let sink = JsonlSink::new(&path).unwrap();
            sink.record(&RunEvent::new(EventLevel::Info, "first".into(), json!({})))
                .unwrap();
            sink.flush().unwrap();
        }
        let sink = JsonlSink::new(&path).unwrap();
        sink.record(&RunEvent::new(EventLevel::Info, "second".into(), json!({})))
            .unwrap();
        sink.flush().unwrap();

        let buffer = std::fs::read_to_string(&path).unwrap();
        assert!(buffer.contains("first"));
        assert!(buffer.contains("second"));
    }

    #[test]
    fn default_telemetry_is_silent() {
        Telemetry::default().error("ignored", json!({}));
    }
}
