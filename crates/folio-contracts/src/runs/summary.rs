use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scenes::{Scene, SceneStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_scenes: u64,
    pub completed_scenes: u64,
    pub failed_scenes: u64,
    pub pending_scenes: u64,
    pub scenes: Vec<Map<String, Value>>,
}

impl BatchSummary {
    /// Tallies scene outcomes. Image payloads are left out; they can be megabytes.
    pub fn from_scenes(
        session_id: impl Into<String>,
        started_at: impl Into<String>,
        scenes: &[Scene],
    ) -> Self {
        let count = |status: SceneStatus| {
            scenes
                .iter()
                .filter(|scene| scene.status == status)
                .count() as u64
        };
        let rows = scenes
            .iter()
            .map(|scene| {
                let mut row = Map::new();
                row.insert("id".to_string(), Value::Number(scene.id.into()));
                row.insert(
                    "status".to_string(),
                    Value::String(scene.status.as_str().to_string()),
                );
                row.insert("quote".to_string(), Value::String(scene.quote.clone()));
                row.insert(
                    "has_image".to_string(),
                    Value::Bool(scene.image_url.is_some()),
                );
                row
            })
            .collect();
        Self {
            session_id: session_id.into(),
            started_at: started_at.into(),
            finished_at: now_utc_iso(),
            total_scenes: scenes.len() as u64,
            completed_scenes: count(SceneStatus::Completed),
            failed_scenes: count(SceneStatus::Error),
            pending_scenes: count(SceneStatus::Pending),
            scenes: rows,
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, BatchSummary};
    use crate::scenes::{Scene, SceneStatus};

    #[test]
    fn summary_counts_outcomes_without_image_payloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut done = Scene::new(1, "", "cover");
        done.mark_completed("data:image/jpeg;base64,AAAA".to_string());
        let mut failed = Scene::new(2, "quote", "prompt");
        failed.status = SceneStatus::Error;
        let waiting = Scene::new(3, "quote", "prompt");

        let summary =
            BatchSummary::from_scenes("session-1", "2026-10-16T00:00:00+00:00", &[done, failed, waiting]);
        let mut extra = Map::new();
        extra.insert("provider".to_string(), json!("dryrun"));
        write_summary(&path, &summary, Some(&extra))?;

        let raw = std::fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["total_scenes"], json!(3));
        assert_eq!(parsed["completed_scenes"], json!(1));
        assert_eq!(parsed["failed_scenes"], json!(1));
        assert_eq!(parsed["pending_scenes"], json!(1));
        assert_eq!(parsed["scenes"][0]["has_image"], json!(true));
        assert_eq!(parsed["provider"], json!("dryrun"));
        assert!(!raw.contains("base64"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
