//! Append-only pipeline event log (`ops/logs/events.jsonl`).
//!
//! One JSON object per line. Stage-specific human-readable logs sit next to
//! it under `ops/logs/<stage>/`. Key material never reaches either.

use crate::core::error::AgentCertError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const EVENT_LOG: &str = "events.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub subject: String,
    pub status: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

pub struct EventLog {
    logs_dir: PathBuf,
}

impl EventLog {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.logs_dir.join(EVENT_LOG)
    }

    pub fn record(
        &self,
        actor: &str,
        op: &str,
        subject: &str,
        status: &str,
        details: serde_json::Value,
    ) -> Result<(), AgentCertError> {
        let ev = PipelineEvent {
            ts: time::now_rfc3339(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            subject: subject.to_string(),
            status: status.to_string(),
            details,
        };
        fs::create_dir_all(&self.logs_dir)?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        writeln!(f, "{}", serde_json::to_string(&ev)?)?;
        Ok(())
    }

    /// Append one line to `ops/logs/<stage>/<lineage>.log`.
    pub fn append_stage_line(&self, stage: &str, lineage: &str, line: &str) -> Result<PathBuf, AgentCertError> {
        let dir = self.logs_dir.join(stage);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.log", lineage));
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", line)?;
        Ok(path)
    }

    pub fn read_events(&self) -> Result<Vec<PipelineEvent>, AgentCertError> {
        let path = self.path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_append_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::new(tmp.path());
        log.record("pat", "preview", "scout@1", "success", serde_json::json!({"tokens": 12}))
            .unwrap();
        log.record("carol", "certify", "scout@1", "error", serde_json::Value::Null)
            .unwrap();
        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, "preview");
        assert_eq!(events[0].details["tokens"], 12);
        assert_eq!(events[1].status, "error");
    }

    #[test]
    fn test_stage_lines_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::new(tmp.path());
        log.append_stage_line("compile", "scout@1", "first").unwrap();
        let path = log.append_stage_line("compile", "scout@1", "second").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "first\nsecond\n");
    }
}
