use crate::{directory::ModelId, encoder::EncodedImage, error::Result};

/// Sends one question about a set of images to a model and returns the answer.
///
/// Implementations block until the complete answer is available. Answers are
/// sampled, so identical inputs may produce different outputs.
pub trait QueryDispatcher {
    fn ask(&self, question: &str, images: &[EncodedImage], model: &ModelId) -> Result<String>;
}

impl<T: QueryDispatcher + ?Sized> QueryDispatcher for std::sync::Arc<T> {
    fn ask(&self, question: &str, images: &[EncodedImage], model: &ModelId) -> Result<String> {
        (**self).ask(question, images, model)
    }
}

impl<T: QueryDispatcher + ?Sized> QueryDispatcher for Box<T> {
    fn ask(&self, question: &str, images: &[EncodedImage], model: &ModelId) -> Result<String> {
        (**self).ask(question, images, model)
    }
}

/// Everything needed for one dispatch, detached from the session it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    pub question: String,
    pub images: Vec<EncodedImage>,
    pub model: ModelId,
}

/// Lightweight description of a [`QueryRequest`], kept without the images.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryMetadata {
    pub question: String,
    pub model: ModelId,
    pub image_count: usize,
}

impl QueryRequest {
    pub fn metadata(&self) -> QueryMetadata {
        QueryMetadata {
            question: self.question.clone(),
            model: self.model.clone(),
            image_count: self.images.len(),
        }
    }

    pub fn dispatch<D: QueryDispatcher + ?Sized>(&self, dispatcher: &D) -> Result<String> {
        dispatcher.ask(&self.question, &self.images, &self.model)
    }
}
