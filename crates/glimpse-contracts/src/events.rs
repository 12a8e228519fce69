use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventFields = Map<String, Value>;

/// Append-only writer for a captioning run's `events.jsonl`.
///
/// One compact JSON object per line. `event`, `run_id`, and `ts` are
/// filled in first; the caller's fields are merged after and may override
/// them.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    run_id: String,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&self, event: &str, fields: EventFields) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in fields {
            row.insert(key, value);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&row)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_writes_one_compact_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = RunLog::new(&path, "run-7");

        let mut fields = EventFields::new();
        fields.insert("file".to_string(), json!("a.png"));
        let written = log.record("caption_saved", fields)?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, written);
        assert_eq!(parsed["event"], json!("caption_saved"));
        assert_eq!(parsed["run_id"], json!("run-7"));
        assert_eq!(parsed["file"], json!("a.png"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn record_appends_and_creates_parent_dirs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("runs").join("events.jsonl");
        let log = RunLog::new(&path, "run-7");

        log.record("run_started", EventFields::new())?;
        log.record("run_finished", EventFields::new())?;

        let content = fs::read_to_string(&path)?;
        let events: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(events, vec!["run_started", "run_finished"]);
        Ok(())
    }

    #[test]
    fn caller_fields_can_override_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = RunLog::new(temp.path().join("events.jsonl"), "run-7");

        let mut fields = EventFields::new();
        fields.insert("run_id".to_string(), json!("other"));
        let written = log.record("run_started", fields)?;
        assert_eq!(written["run_id"], json!("other"));
        Ok(())
    }
}
