//! Image decode/encode capability, bound to the `image` crate.

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageBuffer, ImageEncoder, ImageFormat, Rgb, Rgba};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::tensor_codec::{reconcile_channels, tensor_nchw_to_rgb16};
use crate::types::{Axis, ImageData, Layout, TensorBuffer, RGBA_CHANNELS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        ext.parse().ok()
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            other => Err(format!("unsupported output format '{other}'")),
        }
    }
}

pub trait ImageCodec: Send + Sync {
    /// Decode encoded bytes into RGBA pixels.
    fn decode(&self, bytes: &[u8]) -> Result<ImageData, PipelineError>;

    /// Encode 3- or 4-channel pixels. `quality` (0-100) only affects lossy formats.
    fn encode(&self, image: &ImageData, quality: u8, format: OutputFormat) -> Result<Vec<u8>, PipelineError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec;

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<ImageData, PipelineError> {
        let decoded = image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(ImageData::rgba(rgba.into_raw(), width as usize, height as usize))
    }

    fn encode(&self, image: &ImageData, quality: u8, format: OutputFormat) -> Result<Vec<u8>, PipelineError> {
        if !image.is_consistent() || !(3..=4).contains(&image.channels) {
            return Err(PipelineError::Encode(format!(
                "{} bytes do not describe a {}x{} image with {} channels",
                image.data.len(),
                image.width,
                image.height,
                image.channels
            )));
        }

        let (w, h) = (image.width as u32, image.height as u32);
        let mut out = Vec::new();
        let result = match format {
            OutputFormat::Png => {
                PngEncoder::new(&mut out).write_image(&image.data, w, h, color_type(image.channels))
            }
            OutputFormat::Jpeg => {
                // JPEG carries no alpha.
                let rgb = reconcile_channels(&image.data, image.channels, 3);
                JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
                    .write_image(&rgb, w, h, ExtendedColorType::Rgb8)
            }
            OutputFormat::Webp => {
                let rgba = reconcile_channels(&image.data, image.channels, RGBA_CHANNELS);
                WebPEncoder::new_lossless(&mut out).write_image(&rgba, w, h, ExtendedColorType::Rgba8)
            }
        };
        result.map_err(|e| PipelineError::Encode(e.to_string()))?;
        Ok(out)
    }
}

fn color_type(channels: usize) -> ExtendedColorType {
    if channels == RGBA_CHANNELS {
        ExtendedColorType::Rgba8
    } else {
        ExtendedColorType::Rgb8
    }
}

/// Encode interleaved 16-bit samples (3 or 4 per pixel) as PNG.
pub fn encode_png16(
    samples: Vec<u16>,
    width: usize,
    height: usize,
    channels: usize,
) -> Result<Vec<u8>, PipelineError> {
    let (w, h) = (width as u32, height as u32);
    let shape_error = || {
        PipelineError::Encode(format!(
            "{width}x{height}x{channels} does not match sample count"
        ))
    };
    let dynamic = match channels {
        3 => {
            let buffer = ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, samples).ok_or_else(shape_error)?;
            DynamicImage::ImageRgb16(buffer)
        }
        4 => {
            let buffer = ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, samples).ok_or_else(shape_error)?;
            DynamicImage::ImageRgba16(buffer)
        }
        other => {
            return Err(PipelineError::Encode(format!(
                "16-bit export needs 3 or 4 channels, got {other}"
            )))
        }
    };

    let mut out = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Export an assembled float NCHW tensor as a 16-bit PNG.
pub fn tensor_to_png16(
    tensor: &TensorBuffer,
    dims: [usize; 4],
    layout: Layout,
) -> Result<Vec<u8>, PipelineError> {
    if layout != Layout::NCHW {
        return Err(PipelineError::Encode(format!(
            "16-bit export expects an NCHW tensor, got {layout}"
        )));
    }
    let values = match tensor {
        TensorBuffer::F32(values) => values,
        other => {
            return Err(PipelineError::Encode(format!(
                "16-bit export expects float samples, got {}",
                other.kind()
            )))
        }
    };

    let channels = layout.extent(&dims, Axis::C);
    let height = layout.extent(&dims, Axis::H);
    let width = layout.extent(&dims, Axis::W);
    encode_png16(tensor_nchw_to_rgb16(values, dims), width, height, channels)
}
