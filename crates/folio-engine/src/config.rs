use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use folio_contracts::COVER_SCENE_ID;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Upper bound for any configured wait, in seconds.
pub const MAX_WAIT_S: f64 = 3600.0;

/// API key for the active provider. Never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Credential(<unset>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

/// What the batch loop does when the image backend runs out of quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum QuotaPolicy {
    /// Park the run and wait for `replace_credential` + `resume`.
    PauseForCredential,
    /// Count down and retry the same scene; after `max_cooldowns` rounds,
    /// fall back to pausing for a credential.
    Cooldown { seconds: u64, max_cooldowns: usize },
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::PauseForCredential
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingPolicy {
    /// Minimum gap between consecutive image requests in one run.
    pub request_spacing_s: f64,
    pub quota: QuotaPolicy,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            request_spacing_s: 10.0,
            quota: QuotaPolicy::default(),
        }
    }
}

impl PacingPolicy {
    pub fn request_spacing(&self) -> Duration {
        bounded_seconds(self.request_spacing_s, 0.0, MAX_WAIT_S)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_rate_limit_retries: usize,
    pub backoff_base_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 2,
            backoff_base_s: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential back-off before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = 2f64.powi(attempt.min(16) as i32);
        bounded_seconds(self.backoff_base_s * factor, 0.0, MAX_WAIT_S)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTarget {
    /// Budget for the final data URL, base64 overhead included.
    pub max_bytes: usize,
    pub max_width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityTargets {
    pub cover: QualityTarget,
    pub scene: QualityTarget,
}

impl Default for QualityTargets {
    fn default() -> Self {
        Self {
            cover: QualityTarget {
                max_bytes: 400 * 1024,
                max_width: 1600,
            },
            scene: QualityTarget {
                max_bytes: 200 * 1024,
                max_width: 1024,
            },
        }
    }
}

impl QualityTargets {
    pub fn for_scene(&self, scene_id: u32) -> QualityTarget {
        if scene_id == COVER_SCENE_ID {
            self.cover
        } else {
            self.scene
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptPolicy {
    /// Injected into every image prompt that does not already mention it.
    pub subject_constraint: String,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            subject_constraint: "East Asian characters".to_string(),
        }
    }
}

/// Everything one illustration session needs: provider selection, the
/// credential, and the pacing/retry/quality policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub provider: String,
    pub api_base: Option<String>,
    pub credential: Credential,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub request_timeout_s: f64,
    pub pacing: PacingPolicy,
    pub retry: RetryPolicy,
    pub quality: QualityTargets,
    pub prompt: PromptPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            api_base: None,
            credential: Credential::default(),
            text_model: None,
            image_model: None,
            request_timeout_s: 120.0,
            pacing: PacingPolicy::default(),
            retry: RetryPolicy::default(),
            quality: QualityTargets::default(),
            prompt: PromptPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!("failed reading {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            PipelineError::Config(format!("invalid config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects waits and timeouts that are negative, non-finite or longer
    /// than [`MAX_WAIT_S`].
    pub fn validate(&self) -> PipelineResult<()> {
        let checks = [
            ("pacing.request_spacing_s", self.pacing.request_spacing_s),
            ("retry.backoff_base_s", self.retry.backoff_base_s),
            ("request_timeout_s", self.request_timeout_s),
        ];
        for (field, value) in checks {
            if !value.is_finite() || !(0.0..=MAX_WAIT_S).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "{field} must be between 0 and {MAX_WAIT_S} seconds, got {value}"
                )));
            }
        }
        if let QuotaPolicy::Cooldown { seconds, .. } = self.pacing.quota {
            if seconds as f64 > MAX_WAIT_S {
                return Err(PipelineError::Config(format!(
                    "pacing.quota.seconds must be at most {MAX_WAIT_S}, got {seconds}"
                )));
            }
        }
        Ok(())
    }

    /// Overlays `FOLIO_*` variables and the provider-specific key variables.
    pub fn apply_env(&mut self) {
        self.apply_env_with(non_empty_env);
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("FOLIO_PROVIDER") {
            self.provider = provider.to_ascii_lowercase();
        }
        if let Some(base) = lookup("FOLIO_API_BASE") {
            self.api_base = Some(base);
        }
        if let Some(model) = lookup("FOLIO_TEXT_MODEL") {
            self.text_model = Some(model);
        }
        if let Some(model) = lookup("FOLIO_IMAGE_MODEL") {
            self.image_model = Some(model);
        }
        let provider_key = match self.provider.as_str() {
            "gemini" => lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")),
            "chat" => lookup("OPENROUTER_API_KEY").or_else(|| lookup("OPENAI_API_KEY")),
            _ => None,
        };
        if let Some(key) = lookup("FOLIO_API_KEY").or(provider_key) {
            self.credential = Credential::new(key);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        bounded_seconds(self.request_timeout_s, 5.0, 600.0)
    }

    pub fn api_base_or(&self, default: &str) -> String {
        self.api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

/// NaN falls back to `min`.
fn bounded_seconds(value: f64, min: f64, max: f64) -> Duration {
    let value = if value.is_nan() { min } else { value.clamp(min, max) };
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
