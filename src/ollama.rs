//! Blocking client for an Ollama-compatible inference server.

use serde::{Deserialize, Serialize};

use crate::{
    config::ChatConfig,
    directory::{ModelDirectory, ModelId, ModelMatch},
    dispatcher::QueryDispatcher,
    encoder::EncodedImage,
    error::{ChatError, Result},
};

/// One entry of the `/api/tags` listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    images: &'a [EncodedImage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Talks to the inference server over HTTP. Cloning is cheap and clones share
/// the connection pool.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    client: reqwest::blocking::Client,
    base_url: String,
    model_match: ModelMatch,
}

impl OllamaClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::ServerUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            model_match: config.model_match,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches the full model descriptors from `/api/tags`.
    pub fn tags(&self) -> Result<Vec<ModelDescriptor>> {
        let url = format!("{}/api/tags", self.base_url);
        log::debug!("Fetching available models from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| {
                log::warn!("Model listing failed: {}", e);
                ChatError::ServerUnavailable(e.to_string())
            })?;

        let tags = response
            .json::<TagsResponse>()
            .map_err(|e| ChatError::ServerUnavailable(format!("malformed model listing: {}", e)))?;

        Ok(tags.models)
    }
}

impl ModelDirectory for OllamaClient {
    fn list_models(&self) -> Result<Vec<ModelId>> {
        Ok(self
            .tags()?
            .into_iter()
            .map(|model| ModelId::new(model.name))
            .collect())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.model_match.any(name, &self.list_models()?))
    }
}

impl QueryDispatcher for OllamaClient {
    fn ask(&self, question: &str, images: &[EncodedImage], model: &ModelId) -> Result<String> {
        if !self.exists(model.as_str())? {
            return Err(ChatError::ModelNotAvailable(model.to_string()));
        }

        let url = format!("{}/api/generate", self.base_url);
        log::debug!(
            "Asking {} about {} image(s) at {}",
            model,
            images.len(),
            url
        );

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: model.as_str(),
                prompt: question,
                images,
                stream: false,
            })
            .send()
            .map_err(|e| ChatError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            log::warn!("Generation failed with {}: {}", status, body);
            return Err(ChatError::Inference(format!("{}: {}", status, body)));
        }

        let generated = response
            .json::<GenerateResponse>()
            .map_err(|e| ChatError::Inference(format!("malformed response: {}", e)))?;

        log::debug!("Generation completed");
        Ok(generated.response)
    }
}
