use serde::{Deserialize, Serialize};
use vision_chat::{ChatTurn, ModelId, SessionPhase, SessionState};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelList {
    pub models: Vec<ModelId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSelection {
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuestionRequest {
    pub question: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesUploaded {
    pub count: usize,
    /// `data:` urls of the re-encoded images, in upload order.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionView {
    pub id: u64,
    pub model: Option<ModelId>,
    pub phase: SessionPhase,
    pub transcript: Vec<ChatTurn>,
    pub image_count: usize,
    /// Last failure of a background question, if any.
    pub error: Option<String>,
}

impl SessionView {
    pub fn new(id: u64, state: &SessionState, error: Option<String>) -> Self {
        Self {
            id,
            model: state.model().cloned(),
            phase: state.phase(),
            transcript: state.transcript().to_vec(),
            image_count: state.images().len(),
            error,
        }
    }
}
