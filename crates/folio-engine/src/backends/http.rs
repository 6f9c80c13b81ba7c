use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::compress::to_data_url;
use crate::error::{PipelineError, PipelineResult};

pub(crate) fn http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Reads a provider answer, turning quota and refusal responses into typed
/// errors before anyone downstream sees them.
pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> PipelineResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        PipelineError::GenerationFailed(format!("{provider} response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(classify_failure(provider, code, &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        PipelineError::GenerationFailed(format!("{provider} returned invalid JSON payload: {err}"))
    })
}

pub(crate) fn classify_failure(provider: &str, code: u16, body: &str) -> PipelineError {
    let detail = format!("{provider} request failed ({code}): {}", truncate_text(body, 512));
    let upper = body.to_ascii_uppercase();
    if code == 429 || upper.contains("RESOURCE_EXHAUSTED") {
        return PipelineError::RateLimited(detail);
    }
    if code == 400
        && (upper.contains("SAFETY") || upper.contains("CONTENT_POLICY") || upper.contains("BLOCKED"))
    {
        return PipelineError::ContentPolicyBlocked(detail);
    }
    PipelineError::GenerationFailed(detail)
}

pub(crate) fn transport_error(provider: &str, endpoint: &str, err: reqwest::Error) -> PipelineError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "could not connect"
    } else {
        "failed"
    };
    PipelineError::GenerationFailed(format!("{provider} request {kind} ({endpoint}): {err}"))
}

/// Re-labels non-quota failures as analysis failures.
pub(crate) fn into_analysis_error(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::RateLimited(_)
        | PipelineError::QuotaExceeded { .. }
        | PipelineError::AnalysisFailed(_) => err,
        PipelineError::GenerationFailed(message) | PipelineError::ContentPolicyBlocked(message) => {
            PipelineError::AnalysisFailed(message)
        }
        other => PipelineError::AnalysisFailed(other.to_string()),
    }
}

/// Fetches a remote image and inlines it as a data URL.
pub(crate) fn download_image(http: &HttpClient, provider: &str, url: &str) -> PipelineResult<String> {
    let response = http
        .get(url)
        .send()
        .map_err(|err| transport_error(provider, url, err))?;
    let status = response.status();
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        return Err(classify_failure(provider, code, &body));
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| value.starts_with("image/"))
        .unwrap_or_else(|| "image/png".to_string());
    let bytes = response.bytes().map_err(|err| {
        PipelineError::GenerationFailed(format!("{provider} image bytes read failed: {err}"))
    })?;
    Ok(to_data_url(&bytes, &mime_type))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::{classify_failure, into_analysis_error, truncate_text};
    use crate::error::PipelineError;

    #[test]
    fn quota_answers_become_rate_limited() {
        assert!(matches!(
            classify_failure("gemini", 429, "slow down"),
            PipelineError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure("gemini", 403, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#),
            PipelineError::RateLimited(_)
        ));
    }

    #[test]
    fn safety_refusals_and_other_failures_are_split() {
        assert!(matches!(
            classify_failure("chat", 400, "prompt blocked by SAFETY filter"),
            PipelineError::ContentPolicyBlocked(_)
        ));
        match classify_failure("chat", 500, "internal") {
            PipelineError::GenerationFailed(message) => {
                assert_eq!(message, "chat request failed (500): internal");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn analysis_errors_keep_quota_signal() {
        assert!(into_analysis_error(PipelineError::RateLimited("429".into())).is_quota());
        assert!(matches!(
            into_analysis_error(PipelineError::GenerationFailed("500".into())),
            PipelineError::AnalysisFailed(_)
        ));
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate_text("第一章开始", 2), "第一…");
        assert_eq!(truncate_text("short", 10), "short");
    }
}
