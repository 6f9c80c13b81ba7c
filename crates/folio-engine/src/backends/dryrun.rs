use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use folio_contracts::{Scene, SCENE_COUNT};

use super::analysis::normalize_scenes;
use super::{ImageBackend, ImageRequest, ImageResponse, SceneAnalyzer};
use crate::compress::to_data_url;
use crate::config::Credential;
use crate::error::{PipelineError, PipelineResult};

const QUOTE_CHARS: usize = 24;

/// Offline backend: solid-color images keyed by the prompt, and scenes
/// picked from evenly spaced paragraphs.
#[derive(Debug, Clone)]
pub struct DryrunBackend {
    width: u32,
    height: u32,
}

impl Default for DryrunBackend {
    fn default() -> Self {
        Self {
            width: 320,
            height: 180,
        }
    }
}

impl SceneAnalyzer for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, full_text: &str, _credential: &Credential) -> PipelineResult<Vec<Scene>> {
        let paragraphs: Vec<&str> = full_text
            .split("\n\n")
            .map(str::trim)
            .filter(|paragraph| !paragraph.is_empty() && !paragraph.starts_with('#'))
            .collect();
        if paragraphs.is_empty() {
            return Err(PipelineError::AnalysisFailed(
                "story has no prose paragraphs".to_string(),
            ));
        }

        let mut scenes = vec![cover_scene(full_text, paragraphs[0])];
        let slots = (SCENE_COUNT - 1).min(paragraphs.len());
        for slot in 0..slots {
            let idx = (slot + 1) * paragraphs.len() / (slots + 1);
            let paragraph = paragraphs[idx.min(paragraphs.len() - 1)];
            let mut scene = Scene::new(
                slot as u32 + 2,
                closing_quote(paragraph),
                format!("A storybook scene: {}", excerpt(paragraph, 120)),
            );
            scene.context_description = excerpt(paragraph, 200);
            scene.reasoning = format!("Paragraph {} of {}", idx + 1, paragraphs.len());
            scenes.push(scene);
        }
        normalize_scenes(scenes)
    }
}

impl ImageBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        request: &ImageRequest,
        _credential: &Credential,
    ) -> PipelineResult<ImageResponse> {
        let (r, g, b) = color_from_prompt(&request.prompt, u64::from(request.scene_id));
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| PipelineError::GenerationFailed(format!("dryrun encode failed: {err}")))?;
        Ok(ImageResponse::image(to_data_url(&bytes, "image/png")))
    }
}

fn cover_scene(full_text: &str, opening: &str) -> Scene {
    let title = full_text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .unwrap_or_else(|| short_id(full_text));
    let mut scene = Scene::new(
        1,
        "",
        format!("Cover art for \"{title}\": {}", excerpt(opening, 120)),
    );
    scene.reasoning = "Cover".to_string();
    scene
}

/// The last few characters of a paragraph, verbatim, so anchoring finds them.
fn closing_quote(paragraph: &str) -> String {
    let chars: Vec<char> = paragraph.chars().collect();
    let start = chars.len().saturating_sub(QUOTE_CHARS);
    chars[start..].iter().collect::<String>().trim().to_string()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    flat.chars().take(max_chars).collect()
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("story-{}", hex::encode(&hasher.finalize()[..4]))
}

#[cfg(test)]
mod tests {
    use folio_contracts::SCENE_COUNT;

    use super::{color_from_prompt, DryrunBackend};
    use crate::backends::{ImageBackend, ImageRequest, SceneAnalyzer};
    use crate::config::Credential;

    fn story(paragraphs: usize) -> String {
        let mut text = String::from("# The Lantern Keeper\n\n");
        for idx in 0..paragraphs {
            text.push_str(&format!(
                "At dusk the keeper counts boat number {idx} by the harbour wall.\n\n"
            ));
        }
        text
    }

    #[test]
    fn analysis_quotes_are_verbatim_and_ordered() -> anyhow::Result<()> {
        let text = story(12);
        let scenes = DryrunBackend::default().analyze(&text, &Credential::default())?;
        assert_eq!(scenes.len(), SCENE_COUNT);
        assert!(scenes[0].quote.is_empty());
        assert!(scenes[0].visual_prompt.contains("The Lantern Keeper"));
        let mut last = 0;
        for scene in &scenes[1..] {
            let found = text.find(&scene.quote).map(|at| at >= last);
            assert_eq!(found, Some(true), "{} not found in order", scene.quote);
            last = text.find(&scene.quote).unwrap_or(last);
        }
        Ok(())
    }

    #[test]
    fn short_story_yields_fewer_scenes() -> anyhow::Result<()> {
        let scenes = DryrunBackend::default().analyze(&story(2), &Credential::default())?;
        assert_eq!(scenes.len(), 3);
        assert!(DryrunBackend::default()
            .analyze("# Only a title", &Credential::default())
            .is_err());
        Ok(())
    }

    #[test]
    fn images_are_deterministic_per_prompt() -> anyhow::Result<()> {
        let backend = DryrunBackend::default();
        let request = ImageRequest {
            scene_id: 2,
            prompt: "a quiet harbour".to_string(),
        };
        let first = backend.generate(&request, &Credential::default())?;
        let second = backend.generate(&request, &Credential::default())?;
        assert_eq!(first, second);
        assert!(first
            .image_url
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/png;base64,")));
        assert_ne!(color_from_prompt("a", 1), color_from_prompt("b", 1));
        Ok(())
    }
}
