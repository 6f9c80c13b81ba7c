use thiserror::Error;

/// Machine-checkable code carried by [`PipelineError::QuotaExceeded`].
pub const QUOTA_EXCEEDED_CODE: &str = "QUOTA_EXCEEDED";

/// Error kinds of the illustration pipeline.
///
/// Backend adapters map transport responses onto these variants; nothing
/// downstream inspects status codes or message text.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A single 429 / RESOURCE_EXHAUSTED answer from a backend.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Rate limiting outlived the retry budget; a new credential is needed.
    #[error("quota exceeded after {attempts} attempt(s): {message}")]
    QuotaExceeded { attempts: usize, message: String },

    #[error("content policy blocked the request: {0}")]
    ContentPolicyBlocked(String),

    #[error("scene analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("image generation failed: {0}")]
    GenerationFailed(String),

    #[error("a run is already in progress")]
    Busy,

    #[error("run cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event journal write failed: {0}")]
    Journal(String),
}

impl PipelineError {
    /// True for every variant that a credential swap or a wait can fix.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::QuotaExceeded { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::QuotaExceeded { .. } => QUOTA_EXCEEDED_CODE,
            Self::ContentPolicyBlocked(_) => "CONTENT_POLICY_BLOCKED",
            Self::AnalysisFailed(_) => "ANALYSIS_FAILED",
            Self::GenerationFailed(_) => "GENERATION_FAILED",
            Self::Busy => "BUSY",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG",
            Self::Journal(_) => "JOURNAL",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::{PipelineError, QUOTA_EXCEEDED_CODE};

    #[test]
    fn quota_exceeded_is_distinguishable_by_code() {
        let err = PipelineError::QuotaExceeded {
            attempts: 3,
            message: "429".to_string(),
        };
        assert_eq!(err.code(), QUOTA_EXCEEDED_CODE);
        assert!(err.is_quota());
        assert!(PipelineError::RateLimited("429".to_string()).is_quota());
        assert!(!PipelineError::GenerationFailed("boom".to_string()).is_quota());
        assert!(!PipelineError::ContentPolicyBlocked("SAFETY".to_string()).is_quota());
    }
}
