//! Error types for the prompt optimization engine

use thiserror::Error;

/// Result type alias for optimizer operations
pub type Result<T> = std::result::Result<T, ApoError>;

#[derive(Error, Debug)]
pub enum ApoError {

    // =============================
    // Generation Errors
    // =============================

    #[error("Generation error: {0}")]
    GenerationError(String),

    #[error("Structured decode error: {0}")]
    StructuredDecodeError(String),

    // =============================
    // Structural Errors
    // =============================

    #[error("No validation data")]
    NoValidationData,

    #[error("No evaluation questions")]
    NoEvaluationQuestions,

    #[error("No optimizable sentence in prompt")]
    NoOptimizableSentence,

    #[error("Optimizer is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // Cancellation
    // =============================

    #[error("Operation canceled")]
    Canceled,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ApoError {
    /// True when the error came from the run context being canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ApoError::Canceled)
    }

    /// True for errors a corrective retry may fix.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, ApoError::StructuredDecodeError(_))
    }
}
