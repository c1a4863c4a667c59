use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Session log written as `events.jsonl`.
///
/// Every record carries `type`, `session_id`, `seq` and `ts`; the caller's
/// payload is merged over them. Clones share the file handle and the
/// sequence counter. A [`EventWriter::detached`] writer only builds records.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    session_id: String,
    seq: AtomicU64,
    sink: Option<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::build(
            session_id.into(),
            Some(Sink {
                path: path.into(),
                file: Mutex::new(None),
            }),
        )
    }

    pub fn detached(session_id: impl Into<String>) -> Self {
        Self::build(session_id.into(), None)
    }

    fn build(session_id: String, sink: Option<Sink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id,
                seq: AtomicU64::new(0),
                sink,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.sink.as_ref().map(|sink| sink.path.as_path())
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut record = EventPayload::new();
        record.insert("type".to_string(), event_type.into());
        record.insert("session_id".to_string(), self.shared.session_id.as_str().into());
        record.insert(
            "seq".to_string(),
            self.shared.seq.fetch_add(1, Ordering::SeqCst).into(),
        );
        record.insert(
            "ts".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false).into(),
        );
        record.extend(payload);
        let record = Value::Object(record);

        if let Some(sink) = self.shared.sink.as_ref() {
            sink.append(&record)?;
        }
        Ok(record)
    }
}

impl Sink {
    fn append(&self, record: &Value) -> anyhow::Result<()> {
        let mut slot = self
            .file
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        if slot.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            *slot = Some(BufWriter::new(file));
        }
        let Some(out) = slot.as_mut() else {
            return Ok(());
        };
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{EventPayload, EventWriter};

    fn read_rows(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        fs::read_to_string(path)?
            .lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    #[test]
    fn records_land_in_order_with_sequence() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");
        let clone = writer.clone();

        let mut payload = EventPayload::new();
        payload.insert("provider".to_string(), json!("gemini"));
        let first = writer.emit("generation_completed", payload)?;
        clone.emit("evolution_stopped", EventPayload::new())?;

        let rows = read_rows(&path)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], first);
        assert_eq!(rows[0]["provider"], "gemini");
        assert_eq!(rows[0]["seq"], 0);
        assert_eq!(rows[1]["type"], "evolution_stopped");
        assert_eq!(rows[1]["seq"], 1);
        DateTime::parse_from_rfc3339(rows[0]["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_wins_over_defaults() -> anyhow::Result<()> {
        let writer = EventWriter::detached("session-123");
        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), json!("override"));
        payload.insert("session_id".to_string(), json!("other"));

        let emitted = writer.emit("step_started", payload)?;
        assert_eq!(emitted["type"], "override");
        assert_eq!(emitted["session_id"], "other");
        Ok(())
    }

    #[test]
    fn detached_writer_touches_nothing() -> anyhow::Result<()> {
        let writer = EventWriter::detached("session-9");
        assert!(writer.path().is_none());
        assert_eq!(writer.session_id(), "session-9");
        let emitted = writer.emit("step_started", EventPayload::new())?;
        assert_eq!(emitted["session_id"], "session-9");
        Ok(())
    }
}
