use std::time::Duration;

use folio_contracts::Scene;
use serde::Serialize;

use crate::backends::{ImageBackend, ImageRequest, ImageResponse};
use crate::compress::compress_image;
use crate::config::{Credential, PromptPolicy, QualityTargets, RetryPolicy, SessionConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::pacing::{CancelToken, Pacer};
use crate::sanitizer::{normalize_prompt, sanitize, ULTRA_SAFE_PROMPT};

/// How far a prompt has been softened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTier {
    Raw,
    Sanitized,
    UltraSafe,
}

impl PromptTier {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Raw => Some(Self::Sanitized),
            Self::Sanitized => Some(Self::UltraSafe),
            Self::UltraSafe => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Sanitized => "sanitized",
            Self::UltraSafe => "ultra_safe",
        }
    }
}

/// A scene that already failed once starts from the sanitized prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Fresh,
    RetryAfterFailure,
}

impl Attempt {
    fn starting_tier(self) -> PromptTier {
        match self {
            Self::Fresh => PromptTier::Raw,
            Self::RetryAfterFailure => PromptTier::Sanitized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Escalated {
        from: PromptTier,
        to: PromptTier,
        reason: String,
    },
    RateLimited {
        retry: usize,
        wait: Duration,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
    pub tier: PromptTier,
    pub prompt: String,
    /// JPEG quality used by post-processing; `None` when passed through.
    pub quality: Option<u8>,
}

enum Verdict {
    Image(String),
    PolicyBlocked(String),
    NoImage,
    Failed(String),
}

pub struct ImageGenerator {
    prompt: PromptPolicy,
    retry: RetryPolicy,
    quality: QualityTargets,
}

impl ImageGenerator {
    pub fn new(prompt: PromptPolicy, retry: RetryPolicy, quality: QualityTargets) -> Self {
        Self {
            prompt,
            retry,
            quality,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.prompt.clone(),
            config.retry.clone(),
            config.quality.clone(),
        )
    }

    /// The exact text sent to the backend for `raw` at `tier`.
    pub fn prepare_prompt(&self, raw: &str, tier: PromptTier) -> String {
        let body = match tier {
            PromptTier::Raw => normalize_prompt(raw, &self.prompt),
            PromptTier::Sanitized => sanitize(&normalize_prompt(raw, &self.prompt)),
            PromptTier::UltraSafe => ULTRA_SAFE_PROMPT.to_string(),
        };
        wrap_prompt(&body)
    }

    /// Produces an image for `scene`.
    ///
    /// Rate limiting restarts the whole ladder after an exponential wait on
    /// `pacer`; once the retry budget is spent the result is
    /// `QuotaExceeded`. Content-policy refusals escalate Raw → Sanitized →
    /// UltraSafe and never go past the last rung.
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        &self,
        backend: &dyn ImageBackend,
        credential: &Credential,
        scene: &Scene,
        attempt: Attempt,
        pacer: &dyn Pacer,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(GenerationEvent),
    ) -> PipelineResult<GeneratedImage> {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.run_ladder(backend, credential, scene, attempt, observer) {
                Err(PipelineError::RateLimited(message)) => {
                    if retry >= self.retry.max_rate_limit_retries {
                        return Err(PipelineError::QuotaExceeded {
                            attempts: retry + 1,
                            message,
                        });
                    }
                    let wait = self.retry.backoff(retry);
                    retry += 1;
                    observer(GenerationEvent::RateLimited {
                        retry,
                        wait,
                        message,
                    });
                    if !pacer.wait(wait, cancel) {
                        return Err(PipelineError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }

    fn run_ladder(
        &self,
        backend: &dyn ImageBackend,
        credential: &Credential,
        scene: &Scene,
        attempt: Attempt,
        observer: &mut dyn FnMut(GenerationEvent),
    ) -> PipelineResult<GeneratedImage> {
        let mut tier = attempt.starting_tier();
        loop {
            let prompt = self.prepare_prompt(&scene.visual_prompt, tier);
            let request = ImageRequest {
                scene_id: scene.id,
                prompt: prompt.clone(),
            };
            let verdict = match backend.generate(&request, credential) {
                Ok(response) => classify(response),
                Err(PipelineError::ContentPolicyBlocked(reason)) => Verdict::PolicyBlocked(reason),
                Err(err) => return Err(err),
            };
            let reason = match verdict {
                Verdict::Image(url) => {
                    let compressed = compress_image(&url, &self.quality.for_scene(scene.id));
                    return Ok(GeneratedImage {
                        url: compressed.url,
                        tier,
                        prompt,
                        quality: compressed.quality,
                    });
                }
                Verdict::Failed(reason) => {
                    return Err(PipelineError::GenerationFailed(format!(
                        "scene {} finished with {reason}",
                        scene.id
                    )));
                }
                Verdict::PolicyBlocked(reason) => {
                    if tier == PromptTier::UltraSafe {
                        return Err(PipelineError::ContentPolicyBlocked(reason));
                    }
                    reason
                }
                Verdict::NoImage => {
                    if tier != PromptTier::Raw {
                        return Err(PipelineError::GenerationFailed(format!(
                            "scene {} returned no image",
                            scene.id
                        )));
                    }
                    "no image in response".to_string()
                }
            };
            let Some(next) = tier.next() else {
                return Err(PipelineError::ContentPolicyBlocked(reason));
            };
            observer(GenerationEvent::Escalated {
                from: tier,
                to: next,
                reason,
            });
            tier = next;
        }
    }
}

/// Wraps a prompt in the fixed illustration style template.
pub fn wrap_prompt(body: &str) -> String {
    format!(
        "Cinematic storybook illustration, widescreen composition: {}. Soft natural lighting, rich color, painterly detail, no text, no watermark.",
        body.trim().trim_end_matches('.')
    )
}

fn classify(response: ImageResponse) -> Verdict {
    if !response.has_candidate {
        return Verdict::PolicyBlocked(
            response
                .finish_reason
                .unwrap_or_else(|| "no candidates".to_string()),
        );
    }
    if let Some(reason) = response.finish_reason {
        if is_policy_reason(&reason) {
            return Verdict::PolicyBlocked(reason);
        }
        if !reason.eq_ignore_ascii_case("stop") {
            return Verdict::Failed(reason);
        }
    }
    match response.image_url {
        Some(url) if !url.trim().is_empty() => Verdict::Image(url),
        _ => Verdict::NoImage,
    }
}

fn is_policy_reason(reason: &str) -> bool {
    let lower = reason.trim().to_ascii_lowercase();
    lower.contains("safety") || lower.contains("block") || lower == "recitation" || lower == "other"
}
