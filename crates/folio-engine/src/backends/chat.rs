use std::sync::OnceLock;

use regex::Regex;
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

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TEXT_MODEL: &str = "google/gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "google/gemini-2.5-flash-image";

/// Adapter for OpenAI-style `/chat/completions` gateways such as OpenRouter.
#[derive(Debug, Clone)]
pub struct ChatCompletionsBackend {
    api_base: String,
    text_model: String,
    image_model: String,
    http: HttpClient,
}

impl ChatCompletionsBackend {
    pub fn new(config: &SessionConfig) -> Self {
        let pick = |value: Option<&str>, default: &str| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            api_base: config.api_base_or(DEFAULT_API_BASE),
            text_model: pick(config.text_model.as_deref(), DEFAULT_TEXT_MODEL),
            image_model: pick(config.image_model.as_deref(), DEFAULT_IMAGE_MODEL),
            http: http_client(config.request_timeout()),
        }
    }

    fn post(&self, payload: &Value, credential: &Credential) -> PipelineResult<Value> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(credential.expose())
            .header("X-Title", "Folio")
            .json(payload)
            .send()
            .map_err(|err| transport_error("Chat", &endpoint, err))?;
        response_json_or_error("Chat", response)
    }
}

impl SceneAnalyzer for ChatCompletionsBackend {
    fn name(&self) -> &str {
        "chat"
    }

    fn analyze(&self, full_text: &str, credential: &Credential) -> PipelineResult<Vec<Scene>> {
        let payload = json!({
            "model": self.text_model,
            "temperature": 0.4,
            "messages": [
                {"role": "system", "content": analysis_instructions()},
                {"role": "user", "content": story_excerpt(full_text)},
            ],
        });
        let response = self.post(&payload, credential).map_err(into_analysis_error)?;
        let content = first_message(&response)
            .and_then(|message| message.get("content"))
            .map(content_text)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(PipelineError::AnalysisFailed(
                "chat backend returned an empty analysis".to_string(),
            ));
        }
        parse_scene_payload(&content)
    }
}

impl ImageBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        "chat"
    }

    fn generate(
        &self,
        request: &ImageRequest,
        credential: &Credential,
    ) -> PipelineResult<ImageResponse> {
        let payload = json!({
            "model": self.image_model,
            "modalities": ["image", "text"],
            "messages": [{"role": "user", "content": request.prompt}],
        });
        let response = self.post(&payload, credential)?;
        let mut parsed = parse_chat_image_response(&response);
        if let Some(url) = parsed.image_url.as_deref() {
            if url.starts_with("http://") || url.starts_with("https://") {
                parsed.image_url = Some(download_image(&self.http, "Chat", url)?);
            }
        }
        Ok(parsed)
    }
}

pub(crate) fn parse_chat_image_response(payload: &Value) -> ImageResponse {
    let Some(choice) = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        let reason = payload
            .get("error")
            .and_then(|error| error.get("code").or_else(|| error.get("type")))
            .and_then(|code| code.as_str().map(str::to_string).or_else(|| Some(code.to_string())));
        return ImageResponse::no_candidate(reason.map(|reason| normalize_finish_reason(&reason)));
    };
    let finish_reason = choice
        .get("native_finish_reason")
        .or_else(|| choice.get("finish_reason"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(normalize_finish_reason);
    let message = choice.get("message");
    let image_url = message
        .and_then(|message| message.get("images"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|image| {
            image
                .get("image_url")
                .and_then(|inner| inner.get("url").or(Some(inner)))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            message
                .and_then(|message| message.get("content"))
                .map(content_text)
                .and_then(|text| image_url_in_text(&text))
        });
    ImageResponse {
        has_candidate: true,
        finish_reason,
        image_url,
    }
}

/// Maps OpenAI vocabulary onto the Gemini-style reasons the generator knows.
fn normalize_finish_reason(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    match upper.as_str() {
        "CONTENT_FILTER" => "SAFETY".to_string(),
        "LENGTH" => "MAX_TOKENS".to_string(),
        _ => upper,
    }
}

fn first_message(payload: &Value) -> Option<&Value> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|choice| choice.get("message"))
}

/// Content may be a plain string or a list of typed parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<&str>>()
            .join(""),
        _ => String::new(),
    }
}

fn image_url_in_text(text: &str) -> Option<String> {
    static DATA_URL_RE: OnceLock<Regex> = OnceLock::new();
    static MARKDOWN_IMAGE_RE: OnceLock<Regex> = OnceLock::new();
    static BARE_URL_RE: OnceLock<Regex> = OnceLock::new();
    let data_url = DATA_URL_RE.get_or_init(|| {
        Regex::new(r"data:image/[a-zA-Z+.-]+;base64,[A-Za-z0-9+/=]+")
            .expect("data url regex should compile")
    });
    let markdown_image = MARKDOWN_IMAGE_RE.get_or_init(|| {
        Regex::new(r"!\[[^\]]*\]\((https?://[^)\s]+)\)").expect("markdown image regex should compile")
    });
    let bare_url = BARE_URL_RE.get_or_init(|| {
        Regex::new(r#"(?i)https?://[^\s"'<>)]+\.(?:png|jpe?g|webp|gif)(?:\?[^\s"'<>)]*)?"#)
            .expect("bare url regex should compile")
    });
    if let Some(found) = data_url.find(text) {
        return Some(found.as_str().to_string());
    }
    if let Some(caps) = markdown_image.captures(text) {
        return caps.get(1).map(|url| url.as_str().to_string());
    }
    bare_url.find(text).map(|found| found.as_str().to_string())
}
