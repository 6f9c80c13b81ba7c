use serde::{Deserialize, Serialize};

/// Id of the cover illustration. Its placement ignores the quote.
pub const COVER_SCENE_ID: u32 = 1;

/// Number of illustrations a story receives.
pub const SCENE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Error,
}

impl SceneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// One illustration slot proposed by the analysis model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: u32,
    #[serde(default)]
    pub quote: String,
    #[serde(default)]
    pub context_description: String,
    #[serde(default)]
    pub visual_prompt: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub status: SceneStatus,
}

impl Scene {
    pub fn new(id: u32, quote: impl Into<String>, visual_prompt: impl Into<String>) -> Self {
        Self {
            id,
            quote: quote.into(),
            context_description: String::new(),
            visual_prompt: visual_prompt.into(),
            reasoning: String::new(),
            image_url: None,
            status: SceneStatus::Pending,
        }
    }

    pub fn is_cover(&self) -> bool {
        self.id == COVER_SCENE_ID
    }

    /// Pending scenes are left out of the document entirely; every other
    /// status reserves a slot so the reader sees a spinner or error in place.
    pub fn occupies_slot(&self) -> bool {
        self.status != SceneStatus::Pending
    }

    pub fn mark_completed(&mut self, image_url: String) {
        self.image_url = Some(image_url);
        self.status = SceneStatus::Completed;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{Scene, SceneStatus};

    #[test]
    fn scene_deserializes_model_payload_with_defaults() -> anyhow::Result<()> {
        let scene: Scene = serde_json::from_value(json!({
            "id": 3,
            "quote": "the lantern went out",
            "visualPrompt": "a dark harbour at night",
        }))?;
        assert_eq!(scene.id, 3);
        assert_eq!(scene.status, SceneStatus::Pending);
        assert_eq!(scene.image_url, None);
        assert!(scene.reasoning.is_empty());
        Ok(())
    }

    #[test]
    fn scene_serializes_camel_case_and_lowercase_status() -> anyhow::Result<()> {
        let mut scene = Scene::new(1, "", "a lighthouse");
        scene.mark_completed("data:image/png;base64,AAAA".to_string());
        let value = serde_json::to_value(&scene)?;
        assert_eq!(value["status"], Value::String("completed".to_string()));
        assert_eq!(value["visualPrompt"], json!("a lighthouse"));
        assert_eq!(value["imageUrl"], json!("data:image/png;base64,AAAA"));
        assert!(value.get("contextDescription").is_some());
        Ok(())
    }

    #[test]
    fn only_pending_scenes_are_slotless() {
        let mut scene = Scene::new(2, "q", "p");
        assert!(!scene.occupies_slot());
        for status in [
            SceneStatus::Generating,
            SceneStatus::Completed,
            SceneStatus::Error,
        ] {
            scene.status = status;
            assert!(scene.occupies_slot(), "{} should occupy a slot", status.as_str());
        }
    }
}
