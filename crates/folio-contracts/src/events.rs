use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Every line type an illustration session writes to `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    AnalysisStarted,
    ScenesAnalyzed,
    AnalysisFailed,
    SceneStarted,
    PromptEscalated,
    RateLimited,
    SceneCompleted,
    SceneFailed,
    QuotaExhausted,
    CooldownTick,
    BatchPaused,
    BatchCompleted,
    CredentialReplaced,
    RunReset,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        Self::RunStarted,
        Self::AnalysisStarted,
        Self::ScenesAnalyzed,
        Self::AnalysisFailed,
        Self::SceneStarted,
        Self::PromptEscalated,
        Self::RateLimited,
        Self::SceneCompleted,
        Self::SceneFailed,
        Self::QuotaExhausted,
        Self::CooldownTick,
        Self::BatchPaused,
        Self::BatchCompleted,
        Self::CredentialReplaced,
        Self::RunReset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::AnalysisStarted => "analysis_started",
            Self::ScenesAnalyzed => "scenes_analyzed",
            Self::AnalysisFailed => "analysis_failed",
            Self::SceneStarted => "scene_started",
            Self::PromptEscalated => "prompt_escalated",
            Self::RateLimited => "rate_limited",
            Self::SceneCompleted => "scene_completed",
            Self::SceneFailed => "scene_failed",
            Self::QuotaExhausted => "quota_exhausted",
            Self::CooldownTick => "cooldown_tick",
            Self::BatchPaused => "batch_paused",
            Self::BatchCompleted => "batch_completed",
            Self::CredentialReplaced => "credential_replaced",
            Self::RunReset => "run_reset",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

/// Session journal. Lines are `{type, session_id, ts, ..payload}`.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<JournalFile>,
}

#[derive(Debug)]
struct JournalFile {
    path: PathBuf,
    session_id: String,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JournalFile {
                path: path.into(),
                session_id: session_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends one event. Payload keys win over the header fields.
    pub fn record(&self, kind: EventKind, payload: Value) -> anyhow::Result<Value> {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.emit(kind.as_str(), payload)
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert("session_id".to_string(), Value::from(self.session_id()));
        event.insert(
            "ts".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);
        self.append_line(&serde_json::to_string(&event)?)?;
        Ok(Value::Object(event))
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _held = self
            .inner
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("journal {} is unusable after a panic", self.inner.path.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Event types in journal order. Unparseable lines are skipped.
pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_writes_one_compact_line_per_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("journal").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-7");

        let emitted = writer.record(EventKind::SceneStarted, json!({"scene_id": 3}))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;
        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("scene_started"));
        assert_eq!(parsed["session_id"], json!("session-7"));
        assert_eq!(parsed["scene_id"], json!(3));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn clones_append_to_the_same_journal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-7");
        let clone = writer.clone();

        writer.emit("run_started", EventPayload::new())?;
        clone.record(EventKind::BatchCompleted, json!(null))?;

        assert_eq!(
            read_event_types(&path)?,
            vec!["run_started".to_string(), "batch_completed".to_string()]
        );
        Ok(())
    }

    #[test]
    fn kind_names_match_their_serde_form() -> anyhow::Result<()> {
        for kind in EventKind::ALL {
            assert_eq!(serde_json::to_value(kind)?, json!(kind.as_str()));
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("thread_created"), None);
        Ok(())
    }
}
