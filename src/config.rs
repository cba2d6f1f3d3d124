use std::{num::NonZeroUsize, time::Duration};

use crate::directory::ModelMatch;

/// Where the inference server listens by default.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:11434";

/// Maximum number of images accepted in one upload batch.
pub const DEFAULT_MAX_IMAGES: usize = 7;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime configuration shared by the HTTP client and the session controller.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    /// Base url of the inference server, without a trailing slash.
    pub server_url: String,
    /// Applies to every call made to the inference server.
    pub request_timeout: Duration,
    pub max_images: usize,
    pub model_match: ModelMatch,
    /// Enables the answer cache when set.
    pub cache_capacity: Option<NonZeroUsize>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_images: DEFAULT_MAX_IMAGES,
            model_match: ModelMatch::default(),
            cache_capacity: None,
        }
    }
}

impl ChatConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    pub fn with_model_match(mut self, model_match: ModelMatch) -> Self {
        self.model_match = model_match;
        self
    }

    /// A capacity of zero disables the cache.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = NonZeroUsize::new(capacity);
        self
    }
}
