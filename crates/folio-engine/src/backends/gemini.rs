use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use folio_contracts::Scene;

use super::analysis::{analysis_instructions, parse_scene_payload, story_excerpt};
use super::http::{
    download_image, http_client, into_analysis_error, response_json_or_error, transport_error,
};
use super::{ImageBackend, ImageRequest, ImageResponse, SceneAnalyzer};
use crate::config::{Credential, SessionConfig};
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Direct adapter for the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    api_base: String,
    text_model: String,
    image_model: String,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            api_base: config.api_base_or(DEFAULT_API_BASE),
            text_model: non_empty_or(config.text_model.as_deref(), DEFAULT_TEXT_MODEL),
            image_model: non_empty_or(config.image_model.as_deref(), DEFAULT_IMAGE_MODEL),
            http: http_client(config.request_timeout()),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{model_path}:generateContent", self.api_base)
    }

    fn post(&self, model: &str, payload: &Value, credential: &Credential) -> PipelineResult<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", credential.expose())])
            .json(payload)
            .send()
            .map_err(|err| transport_error("Gemini", &endpoint, err))?;
        response_json_or_error("Gemini", response)
    }

    /// Every category is opened up; refusals are handled by the prompt ladder.
    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "BLOCK_NONE",
            })
        })
        .collect()
    }

    fn image_payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": "16:9" },
            },
            "safetySettings": Self::default_safety_settings(),
        })
    }

    fn analysis_payload(full_text: &str) -> Value {
        json!({
            "systemInstruction": {
                "parts": [{ "text": analysis_instructions() }],
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": story_excerpt(full_text) }],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.4,
            },
            "safetySettings": Self::default_safety_settings(),
        })
    }
}

impl SceneAnalyzer for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, full_text: &str, credential: &Credential) -> PipelineResult<Vec<Scene>> {
        let payload = Self::analysis_payload(full_text);
        let response = self
            .post(&self.text_model, &payload, credential)
            .map_err(into_analysis_error)?;
        let text = candidate_text(&response);
        if text.trim().is_empty() {
            let reason = block_reason(&response)
                .or_else(|| first_finish_reason(&response))
                .unwrap_or_else(|| "empty answer".to_string());
            return Err(PipelineError::AnalysisFailed(format!(
                "Gemini returned no analysis ({reason})"
            )));
        }
        parse_scene_payload(&text)
    }
}

impl ImageBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        request: &ImageRequest,
        credential: &Credential,
    ) -> PipelineResult<ImageResponse> {
        let payload = Self::image_payload(&request.prompt);
        let response = self.post(&self.image_model, &payload, credential)?;
        let mut parsed = parse_image_response(&response);
        if let Some(url) = parsed.image_url.as_deref() {
            if url.starts_with("http://") || url.starts_with("https://") {
                parsed.image_url = Some(download_image(&self.http, "Gemini", url)?);
            }
        }
        Ok(parsed)
    }
}

pub(crate) fn parse_image_response(payload: &Value) -> ImageResponse {
    let Some(candidate) = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        return ImageResponse::no_candidate(block_reason(payload));
    };
    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_uppercase);
    let image_url = candidate_parts(candidate).find_map(|part| {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
        let data = inline.get("data").and_then(Value::as_str)?.trim();
        if data.is_empty() {
            return None;
        }
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        Some(format!("data:{mime};base64,{data}"))
    });
    ImageResponse {
        has_candidate: true,
        finish_reason,
        image_url,
    }
}

fn candidate_parts(candidate: &Value) -> impl Iterator<Item = &Value> {
    candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn candidate_text(payload: &Value) -> String {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .map(|candidate| {
            candidate_parts(candidate)
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default()
}

fn block_reason(payload: &Value) -> Option<String> {
    payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase)
}

fn first_finish_reason(payload: &Value) -> Option<String> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn non_empty_or(value: Option<&str>, default: &str) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{parse_image_response, GeminiBackend};
    use crate::config::SessionConfig;

    #[test]
    fn endpoint_respects_base_and_model_prefix() {
        let config = SessionConfig {
            api_base: Some("https://proxy.example.test/v1beta/".to_string()),
            image_model: Some("models/custom-image".to_string()),
            ..SessionConfig::default()
        };
        let backend = GeminiBackend::new(&config);
        assert_eq!(
            backend.endpoint_for_model(&backend.image_model),
            "https://proxy.example.test/v1beta/models/custom-image:generateContent"
        );
        assert_eq!(
            backend.endpoint_for_model("gemini-2.5-flash"),
            "https://proxy.example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn image_payload_requests_image_modality_with_open_safety() {
        let payload = GeminiBackend::image_payload("a harbour at dawn");
        assert_eq!(payload["generationConfig"]["responseModalities"], json!(["IMAGE"]));
        let safety = payload["safetySettings"].as_array().cloned().unwrap_or_default();
        assert_eq!(safety.len(), 4);
        assert!(safety
            .iter()
            .all(|entry| entry.get("threshold").and_then(Value::as_str) == Some("BLOCK_NONE")));
    }

    #[test]
    fn inline_image_becomes_data_url() {
        let payload = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": {"parts": [
                    {"text": "here"},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}}
                ]}
            }]
        });
        let parsed = parse_image_response(&payload);
        assert!(parsed.has_candidate);
        assert_eq!(parsed.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(
            parsed.image_url.as_deref(),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
    }

    #[test]
    fn blocked_prompt_has_no_candidate() {
        let payload = json!({"promptFeedback": {"blockReason": "safety"}});
        let parsed = parse_image_response(&payload);
        assert!(!parsed.has_candidate);
        assert_eq!(parsed.finish_reason.as_deref(), Some("SAFETY"));

        let payload = json!({"candidates": [{"finishReason": "IMAGE_SAFETY"}]});
        let parsed = parse_image_response(&payload);
        assert!(parsed.has_candidate);
        assert_eq!(parsed.finish_reason.as_deref(), Some("IMAGE_SAFETY"));
        assert_eq!(parsed.image_url, None);
    }
}
