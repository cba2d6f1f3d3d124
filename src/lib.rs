//! Ask a locally served multimodal model questions about a set of images.
//!
//! The pipeline is small: uploads go through the [`encoder`], the
//! [`ollama`] client lists models and answers questions, and a
//! [`SessionController`] keeps the transcript of one user session in an
//! explicit [`SessionState`]. Hosts that cannot block use the [`AskEngine`]
//! worker instead of calling the dispatcher directly.

pub mod cache;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod ollama;
pub mod session;

pub use cache::CachedDispatcher;
pub use config::ChatConfig;
pub use directory::{ModelDirectory, ModelId, ModelMatch};
pub use dispatcher::{QueryDispatcher, QueryMetadata, QueryRequest};
pub use encoder::{EncodedImage, ImageKind, UploadedImage, encode};
pub use engine::{AskEngine, AskEngineResponse, AskEngineResult, AskEngineState};
pub use error::{ChatError, Result};
pub use ollama::OllamaClient;
pub use session::{ChatTurn, Role, SessionController, SessionPhase, SessionState};

/// Builds the dispatcher described by `config`: the HTTP client, behind the
/// answer cache when one is configured.
pub fn dispatcher_from_config(
    config: &ChatConfig,
) -> Result<Box<dyn QueryDispatcher + Send + Sync>> {
    let client = OllamaClient::new(config)?;
    Ok(match config.cache_capacity {
        Some(capacity) => {
            log::info!("Answer cache enabled with {} entries", capacity);
            Box::new(CachedDispatcher::new(client, capacity))
        }
        None => Box::new(client),
    })
}
