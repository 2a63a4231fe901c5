use thiserror::Error;

/// Failure categories surfaced by [`crate::Generator::generate`].
///
/// Callers pick a retry policy from the variant: client faults need a fixed
/// request, `ModelUnavailable` may succeed after operator intervention.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("invalid sketch image: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl GenerateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::Inference(_) => "inference_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::InvalidRequest(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }

    /// Wraps an internal error as an inference failure, keeping the full context chain.
    pub(crate) fn inference(err: anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }
}
