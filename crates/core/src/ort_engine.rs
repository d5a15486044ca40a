//! ONNX Runtime binding of the engine contract.

use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};

use half::f16;
use ort::{session::Session, tensor::PrimitiveTensorElementType, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::engine::{EngineTensor, HostTensor, InferenceEngine, InferenceSession};
use crate::error::EngineError;
use crate::model::Model;
use crate::types::{DataType, Layout, TensorBuffer};

/// Substrings that mark a failure as coming from the accelerator.
const GPU_ERROR_MARKERS: &[&str] = &["gpubuffer", "cuda", "cudnn", "cublas", "tensorrt", "gpu"];

/// Opens one ORT session per chunk on the configured backend.
#[derive(Debug, Clone)]
pub struct OrtEngine {
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
}

impl OrtEngine {
    pub fn new(backend: InferenceBackend) -> Self {
        Self {
            backend,
            trt_cache_dir: None,
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.trt_cache_dir = dir;
        self
    }

    pub fn backend(&self) -> InferenceBackend {
        self.backend
    }
}

impl InferenceEngine for OrtEngine {
    type Session = OrtSession;

    fn create_session(&mut self, model: &Model) -> Result<OrtSession, EngineError> {
        let config = SessionConfig {
            model_path: Path::new(&model.url),
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        };
        let session = build_session(&config).map_err(|e| classify_error(format!("{e:#}")))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| EngineError::Backend(format!("model {} declares no inputs", model.name)))?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| EngineError::Backend(format!("model {} declares no outputs", model.name)))?;

        debug!(%input_name, %output_name, backend = %self.backend, "Session opened");

        Ok(OrtSession {
            session,
            layout: model.layout,
            input_name,
            output_name,
        })
    }
}

pub struct OrtSession {
    session: Session,
    layout: Layout,
    input_name: String,
    output_name: String,
}

impl InferenceSession for OrtSession {
    type Output = HostTensor;

    fn run(&mut self, input: EngineTensor) -> Result<HostTensor, EngineError> {
        let dims = input.dims;
        let is_half = input.data_type == DataType::Float16;
        let (data, out_dims) = match input.data {
            TensorBuffer::F32(values) if is_half => {
                let halves: Vec<f16> = values.into_iter().map(f16::from_f32).collect();
                let (out, out_dims) = self.run_typed(halves, dims)?;
                (TensorBuffer::F32(out.into_iter().map(f16::to_f32).collect()), out_dims)
            }
            TensorBuffer::F32(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::F32(out), d)
            }
            TensorBuffer::F64(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::F64(out), d)
            }
            TensorBuffer::I8(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::I8(out), d)
            }
            TensorBuffer::U8(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::U8(out), d)
            }
            TensorBuffer::U16(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::U16(out), d)
            }
            TensorBuffer::I32(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::I32(out), d)
            }
            TensorBuffer::U32(values) => {
                let (out, d) = self.run_typed(values, dims)?;
                (TensorBuffer::U32(out), d)
            }
        };

        Ok(HostTensor::new(data, out_dims, self.layout))
    }

    fn release(self) {
        debug!(input = %self.input_name, "Session released");
        drop(self.session);
    }
}

impl OrtSession {
    fn run_typed<T>(&mut self, values: Vec<T>, dims: [usize; 4]) -> Result<(Vec<T>, [usize; 4]), EngineError>
    where
        T: PrimitiveTensorElementType + Debug + Clone + 'static,
    {
        let array = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&dims), values)
            .map_err(|e| EngineError::Backend(format!("input does not fit {dims:?}: {e}")))?;
        let tensor = Tensor::from_array(array).map_err(classify_error)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])
            .map_err(classify_error)?;
        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<T>()
            .map_err(classify_error)?;

        let shape: [usize; 4] = view.shape().try_into().map_err(|_| {
            EngineError::Backend(format!("expected a 4-d output, got shape {:?}", view.shape()))
        })?;
        Ok((view.iter().cloned().collect(), shape))
    }
}

/// Sort an engine failure into accelerator or generic backend errors.
pub fn classify_error(error: impl Display) -> EngineError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if GPU_ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
        EngineError::Gpu(message)
    } else {
        EngineError::Backend(message)
    }
}
