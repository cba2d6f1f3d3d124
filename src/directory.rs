use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque name of a model known to the inference server, e.g. `llava:latest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ModelId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// How a requested model name is compared against the server listing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelMatch {
    /// The requested name may be any substring of a listed name, so `llava`
    /// matches `llava:latest`. Short names can match unrelated models.
    #[default]
    Substring,
    /// The requested name must equal a listed name.
    Exact,
}

impl ModelMatch {
    pub fn matches(&self, requested: &str, listed: &str) -> bool {
        match self {
            ModelMatch::Substring => listed.contains(requested),
            ModelMatch::Exact => listed == requested,
        }
    }

    /// Returns true if any of the listed models satisfies the policy.
    pub fn any<'a>(&self, requested: &str, listed: impl IntoIterator<Item = &'a ModelId>) -> bool {
        listed
            .into_iter()
            .any(|model| self.matches(requested, model.as_str()))
    }
}

/// Source of the models currently available on the inference server.
pub trait ModelDirectory {
    /// Fetches the current listing. Fails with `ServerUnavailable`.
    fn list_models(&self) -> Result<Vec<ModelId>>;

    /// Checks whether `name` is served, according to the directory's
    /// [`ModelMatch`] policy.
    fn exists(&self, name: &str) -> Result<bool>;
}

impl<T: ModelDirectory + ?Sized> ModelDirectory for std::sync::Arc<T> {
    fn list_models(&self) -> Result<Vec<ModelId>> {
        (**self).list_models()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name)
    }
}
