mod analysis;
mod chat;
mod dryrun;
mod gemini;
mod http;

use folio_contracts::providers::{NamedProvider, ProviderRegistry};
use folio_contracts::Scene;

use crate::config::{Credential, SessionConfig};
use crate::error::{PipelineError, PipelineResult};

pub use analysis::{normalize_scenes, parse_scene_payload};
pub use chat::ChatCompletionsBackend;
pub use dryrun::DryrunBackend;
pub use gemini::GeminiBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub scene_id: u32,
    pub prompt: String,
}

/// What came back from one image call, before any policy decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageResponse {
    /// False when the provider returned no candidate at all.
    pub has_candidate: bool,
    /// Provider finish reason, upper-cased (`STOP`, `SAFETY`, ...).
    pub finish_reason: Option<String>,
    /// `data:` URL or remote URL of the first image, if any.
    pub image_url: Option<String>,
}

impl ImageResponse {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            has_candidate: true,
            finish_reason: Some("STOP".to_string()),
            image_url: Some(url.into()),
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            has_candidate: true,
            finish_reason: Some(reason.into()),
            image_url: None,
        }
    }

    pub fn no_candidate(block_reason: Option<String>) -> Self {
        Self {
            has_candidate: false,
            finish_reason: block_reason,
            image_url: None,
        }
    }
}

pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &ImageRequest,
        credential: &Credential,
    ) -> PipelineResult<ImageResponse>;
}

pub trait SceneAnalyzer: Send + Sync {
    fn name(&self) -> &str;
    /// Proposes the illustration scenes for `full_text`.
    ///
    /// Fails with `RateLimited` on quota exhaustion and `AnalysisFailed`
    /// otherwise, including when no usable scene comes back.
    fn analyze(&self, full_text: &str, credential: &Credential) -> PipelineResult<Vec<Scene>>;
}

/// The analyzer and image backend a session talks to.
pub struct Backends {
    pub analyzer: Box<dyn SceneAnalyzer>,
    pub images: Box<dyn ImageBackend>,
}

pub struct BackendEntry {
    name: &'static str,
    build: fn(&SessionConfig) -> Backends,
}

impl NamedProvider for BackendEntry {
    fn name(&self) -> &str {
        self.name
    }
}

pub fn backend_registry() -> ProviderRegistry<BackendEntry> {
    ProviderRegistry::new(vec![
        BackendEntry {
            name: "gemini",
            build: |config| {
                let backend = GeminiBackend::new(config);
                Backends {
                    analyzer: Box::new(backend.clone()),
                    images: Box::new(backend),
                }
            },
        },
        BackendEntry {
            name: "chat",
            build: |config| {
                let backend = ChatCompletionsBackend::new(config);
                Backends {
                    analyzer: Box::new(backend.clone()),
                    images: Box::new(backend),
                }
            },
        },
        BackendEntry {
            name: "dryrun",
            build: |_| Backends {
                analyzer: Box::new(DryrunBackend::default()),
                images: Box::new(DryrunBackend::default()),
            },
        },
    ])
}

/// Builds the backends named by `config.provider`.
pub fn build_backends(config: &SessionConfig) -> PipelineResult<Backends> {
    let registry = backend_registry();
    let Some(entry) = registry.get(&config.provider) else {
        return Err(PipelineError::Config(format!(
            "unknown provider '{}' (available: [{}])",
            config.provider,
            registry.list().join(", ")
        )));
    };
    if entry.name != "dryrun" && config.credential.is_empty() {
        return Err(PipelineError::Config(format!(
            "provider '{}' needs an API key (set FOLIO_API_KEY or pass --api-key)",
            entry.name
        )));
    }
    Ok((entry.build)(config))
}
