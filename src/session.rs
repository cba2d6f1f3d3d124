use serde::{Deserialize, Serialize};

use crate::{
    config::DEFAULT_MAX_IMAGES,
    directory::{ModelDirectory, ModelId},
    dispatcher::{QueryDispatcher, QueryRequest},
    encoder::{EncodedImage, UploadedImage},
    error::{ChatError, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the transcript. Turns are only ever appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No images uploaded yet.
    Empty,
    /// Images uploaded, ready for a question.
    Ready,
    /// A question is being answered.
    Awaiting,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Empty => "empty",
            SessionPhase::Ready => "ready",
            SessionPhase::Awaiting => "awaiting",
        }
    }
}

/// Everything one user session knows. Lives only as long as the session.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    model: Option<ModelId>,
    images: Vec<EncodedImage>,
    transcript: Vec<ChatTurn>,
    awaiting: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> Option<&ModelId> {
        self.model.as_ref()
    }

    pub fn images(&self) -> &[EncodedImage] {
        &self.images
    }

    pub fn transcript(&self) -> &[ChatTurn] {
        &self.transcript
    }

    pub fn phase(&self) -> SessionPhase {
        if self.awaiting {
            SessionPhase::Awaiting
        } else if self.images.is_empty() {
            SessionPhase::Empty
        } else {
            SessionPhase::Ready
        }
    }
}

/// Wires user actions on a [`SessionState`] to the model directory and the
/// query dispatcher.
///
/// The controller holds no per-session data, so one controller can serve any
/// number of sessions.
pub struct SessionController<D, M> {
    dispatcher: D,
    directory: M,
    max_images: usize,
}

impl<D: QueryDispatcher, M: ModelDirectory> SessionController<D, M> {
    pub fn new(dispatcher: D, directory: M) -> Self {
        Self {
            dispatcher,
            directory,
            max_images: DEFAULT_MAX_IMAGES,
        }
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn directory(&self) -> &M {
        &self.directory
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    /// Selects a model after checking that the server serves it.
    pub fn set_model(&self, state: &mut SessionState, model: impl Into<ModelId>) -> Result<()> {
        let model = model.into();
        // a blank name is contained in every listed name
        if model.as_str().trim().is_empty() {
            return Err(ChatError::NoModelSelected);
        }
        if !self.directory.exists(model.as_str())? {
            return Err(ChatError::ModelNotAvailable(model.to_string()));
        }

        log::debug!("Selected model {}", model);
        state.model = Some(model);
        Ok(())
    }

    /// Replaces the session's images with a new batch. Nothing changes unless
    /// every file in the batch encodes. An empty batch keeps the current images.
    pub fn set_images(&self, state: &mut SessionState, files: &[UploadedImage]) -> Result<usize> {
        if files.is_empty() {
            return Ok(state.images.len());
        }
        if files.len() > self.max_images {
            return Err(ChatError::TooManyImages {
                count: files.len(),
                max: self.max_images,
            });
        }

        let images = files
            .iter()
            .map(UploadedImage::encode)
            .collect::<Result<Vec<_>>>()?;

        log::debug!("Replaced session images with {} new ones", images.len());
        state.images = images;
        Ok(state.images.len())
    }

    /// Asks a question and blocks until it is answered.
    ///
    /// On failure the user turn stays in the transcript and no assistant turn
    /// is added.
    pub fn submit_question(&self, state: &mut SessionState, text: &str) -> Result<String> {
        let request = self.begin_question(state, text)?;
        let result = request.dispatch(&self.dispatcher);
        self.finish_question(state, result)
    }

    /// First half of [`submit_question`](Self::submit_question): validates the
    /// session, records the user turn and moves the session to `Awaiting`.
    ///
    /// The returned request must be answered through
    /// [`finish_question`](Self::finish_question).
    pub fn begin_question(&self, state: &mut SessionState, text: &str) -> Result<QueryRequest> {
        if state.awaiting {
            return Err(ChatError::Busy);
        }
        let question = text.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyQuestion);
        }
        if state.images.is_empty() {
            return Err(ChatError::NoImagesUploaded);
        }
        let model = state.model.clone().ok_or(ChatError::NoModelSelected)?;

        state.transcript.push(ChatTurn::user(question));
        state.awaiting = true;

        Ok(QueryRequest {
            question: question.to_string(),
            images: state.images.clone(),
            model,
        })
    }

    /// Second half of [`submit_question`](Self::submit_question): records the
    /// answer, if any, and returns the session to `Ready`.
    pub fn finish_question(
        &self,
        state: &mut SessionState,
        result: Result<String>,
    ) -> Result<String> {
        state.awaiting = false;
        match result {
            Ok(answer) => {
                state.transcript.push(ChatTurn::assistant(answer.clone()));
                Ok(answer)
            }
            Err(e) => {
                log::warn!("Question failed: {}", e);
                Err(e)
            }
        }
    }
}
