//! Core crate for chunked neural image upscaling.

pub mod assembler;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod image_io;
pub mod logging;
pub mod model;
pub mod model_registry;
pub mod ort_engine;
pub mod pipeline;
pub mod queue;
pub mod resize;
pub mod slicer;
pub mod tensor_codec;
pub mod tiling;
pub mod types;

pub use assembler::OutputData;
pub use dispatcher::{DispatchStrategy, InferenceDispatcher};
pub use engine::{EngineTensor, InferenceEngine, InferenceSession, OutputTensor};
pub use error::{EngineError, PipelineError};
pub use model::{Model, ModelSpec};
pub use pipeline::{UpscaleInput, UpscaleOptions, UpscaleOutput, Upscaler};
pub use slicer::{ChunkLevel, Slicer};
pub use types::{DataType, ImageData, Layout, TensorBuffer};
