//! Story illustration engine: scene analysis, paced image generation with
//! content-policy escalation, and reassembly of the illustrated document.

pub mod anchor;
pub mod assembler;
pub mod backends;
pub mod board;
pub mod compress;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod fragments;
pub mod generator;
pub mod markdown;
pub mod pacing;
pub mod sanitizer;

pub use assembler::DocumentAssembler;
pub use backends::{build_backends, Backends, ImageBackend, SceneAnalyzer};
pub use board::SceneBoard;
pub use config::{Credential, QuotaPolicy, SessionConfig};
pub use controller::{BatchOutcome, ResumeOutcome, ResumePoint, SceneGenerationController};
pub use error::{PipelineError, PipelineResult};
pub use generator::{ImageGenerator, PromptTier};
pub use pacing::{CancelToken, Pacer, ThreadPacer};
