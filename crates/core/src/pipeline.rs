//! End-to-end upscaling run: input preparation, slicing, dispatch and assembly.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::assembler::OutputData;
use crate::dispatcher::{DispatchStats, DispatchStrategy, InferenceDispatcher};
use crate::engine::InferenceEngine;
use crate::error::PipelineError;
use crate::image_io::{ImageCodec, ImageCrateCodec};
use crate::model::{Model, ModelSpec};
use crate::slicer::{ChunkLevel, SliceResult, Slicer};
use crate::types::{Axis, DataType, ImageData, Layout, TensorBuffer};

/// What a run is asked to upscale.
#[derive(Debug, Clone, PartialEq)]
pub enum UpscaleInput {
    /// Encoded image bytes, decoded with the upscaler's codec.
    File(Vec<u8>),
    /// Interleaved 8-bit pixels; the channel count (3 or 4) follows from the length.
    Pixels {
        data: Vec<u8>,
        width: usize,
        height: usize,
    },
    /// Tensor already shaped for the model. Runs as a single chunk.
    Tensor {
        data: TensorBuffer,
        data_type: DataType,
        layout: Layout,
        dims: [usize; 4],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscaleOptions {
    pub chunk_level: ChunkLevel,
    /// Overrides the level's pixel budget when set.
    pub chunk_size: Option<usize>,
    pub strategy: DispatchStrategy,
    pub preserve_alpha: bool,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            chunk_level: ChunkLevel::default(),
            chunk_size: None,
            strategy: DispatchStrategy::default(),
            preserve_alpha: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleOutput {
    pub image: ImageData,
    pub tensor: Option<TensorBuffer>,
    pub tensor_dims: Option<[usize; 4]>,
    pub layout: Layout,
    pub multiplier: f64,
    pub chunks: usize,
    pub avg_inference_ms: f64,
    pub elapsed: Duration,
}

pub struct Upscaler<E: InferenceEngine, C: ImageCodec = ImageCrateCodec> {
    dispatcher: InferenceDispatcher<E>,
    codec: C,
    options: UpscaleOptions,
}

impl<E: InferenceEngine> Upscaler<E, ImageCrateCodec> {
    pub fn new(engine: E, options: UpscaleOptions) -> Self {
        Self::with_codec(engine, ImageCrateCodec, options)
    }
}

impl<E: InferenceEngine, C: ImageCodec> Upscaler<E, C> {
    pub fn with_codec(engine: E, codec: C, options: UpscaleOptions) -> Self {
        Self {
            dispatcher: InferenceDispatcher::new(engine, options.strategy),
            codec,
            options,
        }
    }

    pub fn options(&self) -> UpscaleOptions {
        self.options
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn into_engine(self) -> Option<E> {
        self.dispatcher.into_engine()
    }

    fn slicer(&self) -> Slicer {
        let slicer = Slicer::new(self.options.chunk_level).with_preserve_alpha(self.options.preserve_alpha);
        match self.options.chunk_size {
            Some(pixels) => slicer.with_chunk_size(pixels),
            None => slicer,
        }
    }

    /// Validate a loose descriptor, then run [`upscale`](Self::upscale).
    pub async fn upscale_spec(
        &mut self,
        input: UpscaleInput,
        spec: &ModelSpec,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<UpscaleOutput, PipelineError> {
        let model = spec.validate()?;
        self.upscale(input, &model, cancel).await
    }

    /// Upscale `input` with `model`. Fails fast; no partial output is returned.
    pub async fn upscale(
        &mut self,
        input: UpscaleInput,
        model: &Model,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<UpscaleOutput, PipelineError> {
        let started = Instant::now();
        let SliceResult { queue, plan } = self.prepare(input, model)?;
        let chunks = queue.total();

        let mut output = OutputData::new(plan, model.layout);
        let stats: DispatchStats = self.dispatcher.run(queue, model, &mut output, cancel).await?;
        output.finish();

        let multiplier = output.multiplier().unwrap_or(1.0);
        let (image, tensor, tensor_dims) = output.into_parts();
        let elapsed = started.elapsed();

        info!(
            model = %model.name,
            width = image.width,
            height = image.height,
            chunks,
            multiplier,
            elapsed_ms = elapsed.as_millis() as u64,
            "Upscale finished"
        );

        Ok(UpscaleOutput {
            image,
            tensor,
            tensor_dims,
            layout: model.layout,
            multiplier,
            chunks,
            avg_inference_ms: stats.avg_inference_ms(),
            elapsed,
        })
    }

    fn prepare(&self, input: UpscaleInput, model: &Model) -> Result<SliceResult, PipelineError> {
        match input {
            UpscaleInput::File(bytes) => {
                let image = self.codec.decode(&bytes)?;
                debug!(width = image.width, height = image.height, "Decoded input image");
                self.slicer().slice(&image, model)
            }
            UpscaleInput::Pixels { data, width, height } => {
                let image = image_from_pixels(data, width, height)?;
                self.slicer().slice(&image, model)
            }
            UpscaleInput::Tensor {
                data,
                data_type,
                layout,
                dims,
            } => {
                let (width, height) = validate_tensor_input(&data, data_type, layout, dims, model)?;
                Ok(self.slicer().slice_tensor(data, width, height, model))
            }
        }
    }
}

/// Wrap raw pixels, inferring 3 or 4 channels from the buffer length.
pub fn image_from_pixels(data: Vec<u8>, width: usize, height: usize) -> Result<ImageData, PipelineError> {
    let pixels = width * height;
    if pixels == 0 {
        return Err(PipelineError::InvalidInputShape(format!(
            "{width}x{height} has no pixels"
        )));
    }
    if data.len() % pixels != 0 || !(3..=4).contains(&(data.len() / pixels)) {
        return Err(PipelineError::InvalidInputShape(format!(
            "{} bytes are not a 3- or 4-channel {width}x{height} image",
            data.len()
        )));
    }
    let channels = data.len() / pixels;
    Ok(ImageData::new(data, width, height, channels))
}

/// Check a pre-built tensor against `model`, returning its `(width, height)`.
pub fn validate_tensor_input(
    data: &TensorBuffer,
    data_type: DataType,
    layout: Layout,
    dims: [usize; 4],
    model: &Model,
) -> Result<(usize, usize), PipelineError> {
    let mut fields = Vec::new();

    if data_type != model.data_type {
        fields.push(format!("dataType ({data_type} != {})", model.data_type));
    }
    if !data.matches(data_type) {
        fields.push(format!("data ({} buffer for {data_type})", data.kind()));
    }
    if layout != model.layout {
        fields.push(format!("layout ({layout} != {})", model.layout));
    }
    let channels = layout.extent(&dims, Axis::C);
    if channels != model.channel {
        fields.push(format!("channel ({channels} != {})", model.channel));
    }
    let batch = layout.extent(&dims, Axis::N);
    if batch != 1 {
        fields.push(format!("batch ({batch} != 1)"));
    }
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        fields.push(format!("dims ({} elements for {dims:?})", data.len()));
    }

    if !fields.is_empty() {
        return Err(PipelineError::TensorMismatch { fields });
    }
    Ok((layout.extent(&dims, Axis::W), layout.extent(&dims, Axis::H)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model::from_url("models/x1.onnx")
    }

    #[test]
    fn test_image_from_pixels_infers_channels() {
        assert_eq!(image_from_pixels(vec![0; 12], 2, 2).unwrap().channels, 3);
        assert_eq!(image_from_pixels(vec![0; 16], 2, 2).unwrap().channels, 4);
        assert!(matches!(
            image_from_pixels(vec![0; 8], 2, 2),
            Err(PipelineError::InvalidInputShape(_))
        ));
        assert!(matches!(
            image_from_pixels(vec![0; 13], 2, 2),
            Err(PipelineError::InvalidInputShape(_))
        ));
        assert!(image_from_pixels(Vec::new(), 0, 4).is_err());
    }

    #[test]
    fn test_validate_tensor_input_accepts_matching_tensor() {
        let data = TensorBuffer::F32(vec![0.0; 3 * 4 * 5]);
        let size = validate_tensor_input(&data, DataType::Float32, Layout::NCHW, [1, 3, 4, 5], &model());
        assert_eq!(size.unwrap(), (5, 4));
    }

    #[test]
    fn test_validate_tensor_input_lists_every_mismatch() {
        let data = TensorBuffer::U8(vec![0; 10]);
        let err = validate_tensor_input(&data, DataType::Uint8, Layout::NHWC, [1, 4, 5, 4], &model())
            .expect_err("mismatch");
        let PipelineError::TensorMismatch { fields } = err else {
            panic!("expected TensorMismatch, got {err:?}");
        };
        assert_eq!(fields.len(), 4, "{fields:?}");
        assert!(fields.iter().any(|f| f.starts_with("dataType")));
        assert!(fields.iter().any(|f| f.starts_with("layout")));
        assert!(fields.iter().any(|f| f.starts_with("channel")));
        assert!(fields.iter().any(|f| f.starts_with("dims")));
    }

    #[test]
    fn test_default_options() {
        let options = UpscaleOptions::default();
        assert_eq!(options.chunk_level, ChunkLevel::Level2);
        assert_eq!(options.strategy, DispatchStrategy::Delegated);
        assert!(options.preserve_alpha);
        assert!(options.chunk_size.is_none());
    }
}
