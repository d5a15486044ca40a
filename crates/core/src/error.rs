//! Error kinds surfaced by the upscaling pipeline.

use thiserror::Error;

/// Failure reported by an inference engine binding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Generic failure inside session creation or execution.
    #[error("inference backend error: {0}")]
    Backend(String),

    /// Failure originating in the accelerator's own buffers or device.
    #[error("gpu error: {0}")]
    Gpu(String),
}

/// Errors that abort an upscaling run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model descriptor is missing required fields or carries invalid values.
    #[error("invalid model descriptor: {}", .fields.join(", "))]
    Validation { fields: Vec<String> },

    /// Pre-built tensor input disagrees with the model.
    #[error("tensor input does not match model: {}", .fields.join(", "))]
    TensorMismatch { fields: Vec<String> },

    /// Image decode capability failed.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// Image encode capability failed.
    #[error("failed to encode image: {0}")]
    Encode(String),

    /// Caller supplied neither a file nor a correctly dimensioned buffer.
    #[error("invalid input shape: {0}")]
    InvalidInputShape(String),

    #[error("inference failed on chunk {chunk}: {message}")]
    Engine { chunk: usize, message: String },

    /// Accelerator failure; callers may retry on a CPU-only backend.
    #[error("gpu error on chunk {chunk}: {message}")]
    Gpu { chunk: usize, message: String },

    /// Delegated execution context broke the handshake or died.
    #[error("inference worker failed: {0}")]
    Worker(String),

    #[error("upscaling cancelled after {completed} of {total} chunks")]
    Cancelled { completed: usize, total: usize },
}

impl PipelineError {
    pub fn from_engine(chunk: usize, error: EngineError) -> Self {
        match error {
            EngineError::Backend(message) => Self::Engine { chunk, message },
            EngineError::Gpu(message) => Self::Gpu { chunk, message },
        }
    }

    pub fn is_gpu_error(&self) -> bool {
        matches!(self, Self::Gpu { .. })
    }
}
