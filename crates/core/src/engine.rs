//! Contract between the pipeline and an inference engine.
//!
//! An engine opens one [`InferenceSession`] per chunk; the session runs a
//! single input and hands back an [`OutputTensor`]. Output tensors and
//! sessions are released explicitly after every chunk.

use crate::error::EngineError;
use crate::model::Model;
use crate::tensor_codec::tensor_to_image;
use crate::types::{DataType, ImageData, Layout, TensorBuffer};

/// Input tensor handed to [`InferenceSession::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineTensor {
    pub data_type: DataType,
    pub data: TensorBuffer,
    pub dims: [usize; 4],
}

impl EngineTensor {
    /// Checks that `data` is the storage kind of `data_type` and fills `dims` exactly.
    pub fn new(data_type: DataType, data: TensorBuffer, dims: [usize; 4]) -> Result<Self, EngineError> {
        if !data.matches(data_type) {
            return Err(EngineError::Backend(format!(
                "{} buffer cannot back a {data_type} tensor",
                data.kind()
            )));
        }
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(EngineError::Backend(format!(
                "tensor with {} elements does not fit dims {dims:?}",
                data.len()
            )));
        }
        Ok(Self {
            data_type,
            data,
            dims,
        })
    }
}

pub trait InferenceEngine: Send + 'static {
    type Session: InferenceSession;

    /// Open a session for `model`.
    fn create_session(&mut self, model: &Model) -> Result<Self::Session, EngineError>;
}

pub trait InferenceSession {
    type Output: OutputTensor;

    fn run(&mut self, input: EngineTensor) -> Result<Self::Output, EngineError>;

    fn release(self);
}

pub trait OutputTensor {
    /// Image rendering of the output as RGBA pixels.
    fn to_image_data(&self) -> Result<ImageData, EngineError>;

    /// Move the raw element buffer out. Later calls return an empty buffer.
    fn raw_data(&mut self) -> Result<TensorBuffer, EngineError>;

    fn dims(&self) -> [usize; 4];

    fn dispose(self);
}

/// Output tensor already copied into host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub data: TensorBuffer,
    pub dims: [usize; 4],
    pub layout: Layout,
}

impl HostTensor {
    pub fn new(data: TensorBuffer, dims: [usize; 4], layout: Layout) -> Self {
        Self { data, dims, layout }
    }
}

impl OutputTensor for HostTensor {
    fn to_image_data(&self) -> Result<ImageData, EngineError> {
        tensor_to_image(&self.data, self.dims, self.layout)
            .map_err(|e| EngineError::Backend(e.to_string()))
    }

    fn raw_data(&mut self) -> Result<TensorBuffer, EngineError> {
        let empty = TensorBuffer::zeros(DataType::Uint8, 0);
        Ok(std::mem::replace(&mut self.data, empty))
    }

    fn dims(&self) -> [usize; 4] {
        self.dims
    }

    fn dispose(self) {}
}
