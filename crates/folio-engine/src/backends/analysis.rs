use folio_contracts::{Scene, SceneStatus, SCENE_COUNT};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// Longest story excerpt sent to the text model.
pub(crate) const MAX_ANALYSIS_CHARS: usize = 60_000;

pub(crate) fn analysis_instructions() -> String {
    format!(
        concat!(
            "You are an art director choosing illustrations for a story.\n",
            "Pick exactly {count} moments. Moment 1 is the cover and summarizes the whole story; ",
            "moments 2 to {count} follow the order in which they happen.\n",
            "Reply with a JSON array only. Each element has the keys ",
            "\"id\" (1-{count}), \"quote\", \"contextDescription\", \"visualPrompt\" and \"reasoning\".\n",
            "Rules:\n",
            "- \"quote\" is copied character for character from the story, 10 to 30 characters long, ",
            "taken from the end of the passage the image belongs after. Leave it empty for the cover.\n",
            "- \"visualPrompt\" is an English description of the image: subjects, setting, light, mood. ",
            "No camera settings, aspect ratios or chapter numbers.\n",
            "- \"reasoning\" is one short sentence explaining the choice.\n"
        ),
        count = SCENE_COUNT
    )
}

pub(crate) fn story_excerpt(full_text: &str) -> String {
    full_text.chars().take(MAX_ANALYSIS_CHARS).collect()
}

/// Parses a model answer into scenes.
///
/// Accepts a bare array, an object with a `scenes` array, and either form
/// wrapped in a Markdown code fence or surrounded by chatter.
pub fn parse_scene_payload(raw: &str) -> PipelineResult<Vec<Scene>> {
    let Some(value) = locate_json(raw) else {
        return Err(PipelineError::AnalysisFailed(
            "analysis answer contained no JSON".to_string(),
        ));
    };
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("scenes") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(PipelineError::AnalysisFailed(
                    "analysis answer has no scenes array".to_string(),
                ))
            }
        },
        _ => {
            return Err(PipelineError::AnalysisFailed(
                "analysis answer is not a list of scenes".to_string(),
            ))
        }
    };
    let scenes = rows
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| scene_from_value(row, idx))
        .collect();
    normalize_scenes(scenes)
}

/// Orders scenes by id, keeps the first six, renumbers them 1..=n and
/// resets them to pending without images.
pub fn normalize_scenes(mut scenes: Vec<Scene>) -> PipelineResult<Vec<Scene>> {
    if scenes.is_empty() {
        return Err(PipelineError::AnalysisFailed(
            "analysis returned no scenes".to_string(),
        ));
    }
    scenes.sort_by_key(|scene| scene.id);
    scenes.truncate(SCENE_COUNT);
    for (idx, scene) in scenes.iter_mut().enumerate() {
        scene.id = idx as u32 + 1;
        scene.status = SceneStatus::Pending;
        scene.image_url = None;
    }
    Ok(scenes)
}

fn locate_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let unfenced = strip_code_fence(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Some(value);
    }
    for (open, close) in [('[', ']'), ('{', '}')] {
        let (Some(start), Some(end)) = (unfenced.find(open), unfenced.rfind(close)) else {
            continue;
        };
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                return Some(value);
            }
        }
    }
    None
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn scene_from_value(value: &Value, idx: usize) -> Option<Scene> {
    let obj = value.as_object()?;
    let text = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let visual_prompt = text(&["visualPrompt", "visual_prompt", "prompt"]);
    if visual_prompt.is_empty() {
        return None;
    }
    let id = obj
        .get("id")
        .and_then(|raw| {
            raw.as_u64()
                .or_else(|| raw.as_str().and_then(|text| text.trim().parse().ok()))
        })
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or(idx as u32 + 1);
    let mut scene = Scene::new(id, text(&["quote"]), visual_prompt);
    scene.context_description = text(&["contextDescription", "context_description", "context"]);
    scene.reasoning = text(&["reasoning", "reason"]);
    Some(scene)
}

#[cfg(test)]
mod tests {
    use folio_contracts::SceneStatus;

    use super::{normalize_scenes, parse_scene_payload};
    use crate::error::PipelineError;

    #[test]
    fn parses_fenced_array_and_renumbers() -> anyhow::Result<()> {
        let raw = r#"```json
[
  {"id": 3, "quote": "the lamp went out", "visualPrompt": "a dark study", "reasoning": "turning point"},
  {"id": "1", "quote": "", "visualPrompt": "a lighthouse on a cliff", "contextDescription": "cover"},
  {"id": 2, "quote": "she ran", "visualPrompt": ""}
]
```"#;
        let scenes = parse_scene_payload(raw)?;
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0].id, 1);
        assert_eq!(scenes[0].visual_prompt, "a lighthouse on a cliff");
        assert_eq!(scenes[0].context_description, "cover");
        assert_eq!(scenes[1].id, 2);
        assert_eq!(scenes[1].quote, "the lamp went out");
        assert!(scenes.iter().all(|scene| scene.status == SceneStatus::Pending));
        Ok(())
    }

    #[test]
    fn accepts_wrapped_object_with_chatter() -> anyhow::Result<()> {
        let raw = r#"Here you go: {"scenes": [{"quote": "q", "visualPrompt": "p"}]} Enjoy!"#;
        let scenes = parse_scene_payload(raw)?;
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].id, 1);
        Ok(())
    }

    #[test]
    fn rejects_empty_and_non_json_answers() {
        assert!(matches!(
            parse_scene_payload("I cannot help with that."),
            Err(PipelineError::AnalysisFailed(_))
        ));
        assert!(matches!(
            parse_scene_payload("[]"),
            Err(PipelineError::AnalysisFailed(_))
        ));
        assert!(normalize_scenes(Vec::new()).is_err());
    }

    #[test]
    fn keeps_at_most_six_scenes() -> anyhow::Result<()> {
        let rows: Vec<String> = (1..=9)
            .map(|id| format!(r#"{{"id": {id}, "quote": "q{id}", "visualPrompt": "p{id}"}}"#))
            .collect();
        let scenes = parse_scene_payload(&format!("[{}]", rows.join(",")))?;
        assert_eq!(scenes.len(), 6);
        assert_eq!(scenes[5].quote, "q6");
        Ok(())
    }
}
