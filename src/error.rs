/// Errors surfaced to the user for the action that triggered them.
///
/// None of them are retried and none of them leave the session in a broken
/// state: the failed action is simply dropped.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The uploaded bytes are not a supported image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),

    /// The model listing could not be fetched.
    #[error("error connecting to the inference server: {0}")]
    ServerUnavailable(String),

    #[error("model '{0}' is not available on the inference server, please pull it manually")]
    ModelNotAvailable(String),

    #[error("you can upload at most {max} images, got {count}")]
    TooManyImages { count: usize, max: usize },

    #[error("please upload images first to start chatting")]
    NoImagesUploaded,

    #[error("please choose a model first")]
    NoModelSelected,

    #[error("the question is empty")]
    EmptyQuestion,

    /// A question is already in flight for this session.
    #[error("still answering the previous question")]
    Busy,

    /// The generation call failed, timed out or returned a malformed body.
    #[error("inference request failed: {0}")]
    Inference(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
