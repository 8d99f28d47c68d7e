/// Errors raised while loading a checkpoint or running a generation session.
///
/// The first group of variants (up to [`VlmError::UnknownProcessor`]) belongs to the
/// load path and is always fatal to the load attempt. The remaining variants terminate
/// a single generation session and leave the loaded model untouched.
#[derive(thiserror::Error, Debug)]
pub enum VlmError {
    #[error("Checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("Weights unreadable: {0}")]
    WeightsUnreadable(String),

    #[error("Weight shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Missing weights: {0}")]
    MissingWeights(String),

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Mismatched visual token count: placeholders = {placeholders}, features = {features}")]
    VisualTokenCountMismatch { placeholders: usize, features: usize },

    #[error("Context length exceeded: requested = {requested}, maximum = {maximum}")]
    ContextLengthExceeded { requested: usize, maximum: usize },

    #[error("Tokenization failure: {0}")]
    TokenizationFailure(String),

    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    #[error("Inference failure: {0}")]
    InferenceFailure(#[from] candle_core::Error),
}

impl VlmError {
    /// Whether the error comes from the load path.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            VlmError::CheckpointUnavailable(_)
                | VlmError::InvalidConfiguration(_)
                | VlmError::UnknownArchitecture(_)
                | VlmError::WeightsUnreadable(_)
                | VlmError::WeightShapeMismatch { .. }
                | VlmError::MissingWeights(_)
                | VlmError::UnknownProcessor(_)
        )
    }

    pub(crate) fn inference<S: Into<String>>(msg: S) -> Self {
        VlmError::InferenceFailure(candle_core::Error::Msg(msg.into()))
    }
}
