//! Conversions between interleaved 8-bit pixels and model tensors.
//!
//! Tensors are addressed through [`Layout::strides`], so every axis
//! permutation (NCHW, NHWC, ...) shares one code path. Float tensors hold
//! values in `[0, 1]`; integer tensors carry raw 0–255 samples.

use crate::error::PipelineError;
use crate::model::Model;
use crate::types::{with_buffer, DataType, ImageData, Layout, TensorBuffer, RGBA_CHANNELS};

const OPAQUE: u8 = 255;

/// Reorder interleaved pixels into `model.layout`, reconciling channel count.
///
/// Missing alpha is filled with 255; surplus alpha is dropped. The result is
/// still 8-bit; see [`encode_tensor`] for the numeric conversion.
pub fn transpose_to_tensor(
    pixels: &[u8],
    input_channels: usize,
    width: usize,
    height: usize,
    model: &Model,
) -> Result<Vec<u8>, PipelineError> {
    if !(3..=4).contains(&input_channels) {
        return Err(PipelineError::InvalidInputShape(format!(
            "expected 3 or 4 input channels, got {input_channels}"
        )));
    }
    if pixels.len() != width * height * input_channels {
        return Err(PipelineError::InvalidInputShape(format!(
            "pixel buffer holds {} bytes, expected {} ({width}x{height}x{input_channels})",
            pixels.len(),
            width * height * input_channels
        )));
    }

    let channels = model.channel;
    let dims = model.layout.dims(1, channels, height, width);
    let strides = model.layout.strides(&dims);
    let mut out = vec![0u8; width * height * channels];

    for y in 0..height {
        for x in 0..width {
            let src = (y * width + x) * input_channels;
            for c in 0..channels {
                let value = if c < input_channels {
                    pixels[src + c]
                } else {
                    OPAQUE
                };
                out[strides.offset(0, c, y, x)] = value;
            }
        }
    }

    Ok(out)
}

/// Scale 8-bit samples to `[0, 1]`.
pub fn convert_to_float(src: &[u8]) -> Vec<f32> {
    src.iter().map(|&v| v as f32 / 255.0).collect()
}

/// Scale `[0, 1]` samples back to 8-bit, rounding and clamping.
pub fn convert_to_8bit(src: &[f32]) -> Vec<u8> {
    src.iter().map(|&v| unit_to_u8(v as f64)).collect()
}

fn unit_to_u8(v: f64) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Store 8-bit tensor samples in the array kind `data_type` maps to.
pub fn encode_tensor(samples: Vec<u8>, data_type: DataType) -> TensorBuffer {
    match data_type {
        DataType::Float32 | DataType::Float16 => TensorBuffer::F32(convert_to_float(&samples)),
        DataType::Float64 => {
            TensorBuffer::F64(samples.iter().map(|&v| v as f64 / 255.0).collect())
        }
        DataType::Int8 => TensorBuffer::I8(samples.iter().map(|&v| (v >> 1) as i8).collect()),
        DataType::Uint8 => TensorBuffer::U8(samples),
        DataType::Uint16 => TensorBuffer::U16(samples.iter().map(|&v| v as u16).collect()),
        DataType::Int32 => TensorBuffer::I32(samples.iter().map(|&v| v as i32).collect()),
        DataType::Uint32 => TensorBuffer::U32(samples.iter().map(|&v| v as u32).collect()),
    }
}

/// Build the model input for one chunk of interleaved pixels.
pub fn pixels_to_tensor(
    pixels: &[u8],
    input_channels: usize,
    width: usize,
    height: usize,
    model: &Model,
) -> Result<TensorBuffer, PipelineError> {
    let samples = transpose_to_tensor(pixels, input_channels, width, height, model)?;
    Ok(encode_tensor(samples, model.data_type))
}

/// Render an image tensor as interleaved RGBA.
///
/// Float values are treated as `[0, 1]`; integers are clamped to 0–255.
/// Three-channel tensors become opaque; single-channel tensors are grey.
pub fn tensor_to_image(
    tensor: &TensorBuffer,
    dims: [usize; 4],
    layout: Layout,
) -> Result<ImageData, PipelineError> {
    use crate::types::Axis;

    let channels = layout.extent(&dims, Axis::C);
    let height = layout.extent(&dims, Axis::H);
    let width = layout.extent(&dims, Axis::W);
    let expected = layout.extent(&dims, Axis::N).max(1) * channels * height * width;
    if tensor.len() < expected || channels == 0 {
        return Err(PipelineError::InvalidInputShape(format!(
            "tensor with {} elements cannot hold dims {dims:?} ({layout})",
            tensor.len()
        )));
    }

    let strides = layout.strides(&dims);
    let samples: Vec<u8> = match tensor {
        TensorBuffer::F32(v) => v.iter().map(|&x| unit_to_u8(x as f64)).collect(),
        TensorBuffer::F64(v) => v.iter().map(|&x| unit_to_u8(x)).collect(),
        other => with_buffer!(other, v => v.iter().map(|&x| (x as f64).clamp(0.0, 255.0) as u8).collect()),
    };

    let mut rgba = vec![OPAQUE; width * height * RGBA_CHANNELS];
    for y in 0..height {
        for x in 0..width {
            let dst = (y * width + x) * RGBA_CHANNELS;
            for c in 0..RGBA_CHANNELS {
                let src_c = if channels == 1 { 0 } else { c };
                if c == 3 && channels < 4 {
                    continue;
                }
                if src_c < channels {
                    rgba[dst + c] = samples[strides.offset(0, src_c, y, x)];
                }
            }
        }
    }

    Ok(ImageData::rgba(rgba, width, height))
}

/// Reorder an NCHW float tensor to interleaved samples scaled to 16 bits.
pub fn tensor_nchw_to_rgb16(tensor: &[f32], dims: [usize; 4]) -> Vec<u16> {
    let [batch, channels, height, width] = dims;
    let mut out = Vec::with_capacity(batch * channels * height * width);

    for b in 0..batch {
        for h in 0..height {
            for w in 0..width {
                for c in 0..channels {
                    let idx = b * (channels * height * width) + c * (height * width) + h * width + w;
                    let value = tensor.get(idx).copied().unwrap_or(0.0);
                    out.push((value as f64 * 65535.0).round().clamp(0.0, 65535.0) as u16);
                }
            }
        }
    }

    out
}

/// Convert interleaved pixels between 3 and 4 channels.
pub fn reconcile_channels(pixels: &[u8], from: usize, to: usize) -> Vec<u8> {
    match (from, to) {
        (4, 3) => pixels
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
        (3, 4) => pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], OPAQUE])
            .collect(),
        _ => pixels.to_vec(),
    }
}

/// Channel-4 bytes of an interleaved RGBA buffer.
pub fn extract_alpha(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(RGBA_CHANNELS).map(|p| p[3]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn model(channel: usize, layout: Layout, data_type: DataType) -> Model {
        Model {
            name: "m".into(),
            url: "m.onnx".into(),
            channel,
            data_type,
            layout,
            tile_size: None,
        }
    }

    // 2x1 RGBA: red (alpha 10), blue (alpha 20)
    const RGBA_2X1: [u8; 8] = [255, 0, 0, 10, 0, 0, 255, 20];

    #[test]
    fn test_nchw_drops_alpha_for_three_channel_model() {
        let m = model(3, Layout::NCHW, DataType::Float32);
        let out = transpose_to_tensor(&RGBA_2X1, 4, 2, 1, &m).unwrap();
        assert_eq!(out, vec![255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn test_nchw_adds_opaque_alpha_plane_for_four_channel_model() {
        let m = model(4, Layout::NCHW, DataType::Float32);
        let rgb = [1, 2, 3, 4, 5, 6];
        let out = transpose_to_tensor(&rgb, 3, 2, 1, &m).unwrap();
        assert_eq!(out, vec![1, 4, 2, 5, 3, 6, 255, 255]);
    }

    #[test]
    fn test_nhwc_downgrade_and_upgrade() {
        let m3 = model(3, Layout::NHWC, DataType::Float32);
        let out = transpose_to_tensor(&RGBA_2X1, 4, 2, 1, &m3).unwrap();
        assert_eq!(out, vec![255, 0, 0, 0, 0, 255]);

        let m4 = model(4, Layout::NHWC, DataType::Float32);
        let out = transpose_to_tensor(&[1, 2, 3], 3, 1, 1, &m4).unwrap();
        assert_eq!(out, vec![1, 2, 3, 255]);
    }

    #[test]
    fn test_transpose_rejects_wrong_length() {
        let m = model(3, Layout::NCHW, DataType::Float32);
        let err = transpose_to_tensor(&[0u8; 10], 4, 2, 1, &m).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInputShape(_)));
    }

    #[test]
    fn test_float_conversion_roundtrip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let floats = convert_to_float(&bytes);
        assert_eq!(floats[0], 0.0);
        assert_eq!(floats[255], 1.0);
        assert_eq!(convert_to_8bit(&floats), bytes);
    }

    #[test]
    fn test_convert_to_8bit_rounds_and_clamps() {
        assert_eq!(convert_to_8bit(&[-0.5, 0.5, 1.5, 0.002]), vec![0, 128, 255, 1]);
    }

    #[test]
    fn test_encode_tensor_selects_kind() {
        let float16 = encode_tensor(vec![255], DataType::Float16);
        assert!(matches!(float16, TensorBuffer::F32(v) if v == vec![1.0]));
        let bytes = encode_tensor(vec![255], DataType::Uint8);
        assert!(matches!(bytes, TensorBuffer::U8(v) if v == vec![255]));
        let double = encode_tensor(vec![51], DataType::Float64);
        assert!(matches!(double, TensorBuffer::F64(v) if (v[0] - 0.2).abs() < 1e-9));
    }

    #[test]
    fn test_tensor_to_image_nchw_three_channel() {
        // 2x1, planes R=[1,0], G=[0,0.5], B=[0,1]
        let t = TensorBuffer::F32(vec![1.0, 0.0, 0.0, 0.5, 0.0, 1.0]);
        let img = tensor_to_image(&t, [1, 3, 1, 2], Layout::NCHW).unwrap();
        assert_eq!((img.width, img.height, img.channels), (2, 1, 4));
        assert_eq!(img.data, vec![255, 0, 0, 255, 0, 128, 255, 255]);
    }

    #[test]
    fn test_tensor_to_image_nhwc_four_channel_u8() {
        let t = TensorBuffer::U8(vec![1, 2, 3, 4]);
        let img = tensor_to_image(&t, [1, 1, 1, 4], Layout::NHWC).unwrap();
        assert_eq!(img.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_tensor_to_image_rejects_short_buffer() {
        let t = TensorBuffer::F32(vec![0.0; 5]);
        assert!(tensor_to_image(&t, [1, 3, 1, 2], Layout::NCHW).is_err());
    }

    #[test]
    fn test_pixels_to_tensor_roundtrip_through_image() {
        let m = model(3, Layout::NCHW, DataType::Float32);
        let pixels: Vec<u8> = (0..24).map(|i| (i * 10) as u8).collect();
        let tensor = pixels_to_tensor(&pixels, 4, 3, 2, &m).unwrap();
        let img = tensor_to_image(&tensor, m.chunk_dims(2, 3), m.layout).unwrap();
        for (src, dst) in pixels.chunks_exact(4).zip(img.data.chunks_exact(4)) {
            assert_eq!(&src[..3], &dst[..3]);
            assert_eq!(dst[3], 255);
        }
    }

    #[test]
    fn test_tensor_nchw_to_rgb16() {
        // 1x1 pixel, 3 channels
        let out = tensor_nchw_to_rgb16(&[1.0, 0.5, -1.0], [1, 3, 1, 1]);
        assert_eq!(out, vec![65535, 32768, 0]);

        // 2x1, planes interleaved back per pixel
        let out = tensor_nchw_to_rgb16(&[0.0, 1.0, 1.0, 0.0, 2.0, 0.0], [1, 3, 1, 2]);
        assert_eq!(out, vec![0, 65535, 65535, 65535, 0, 0]);
    }

    #[test]
    fn test_reconcile_channels_and_extract_alpha() {
        assert_eq!(reconcile_channels(&RGBA_2X1, 4, 3), vec![255, 0, 0, 0, 0, 255]);
        assert_eq!(reconcile_channels(&[1, 2, 3], 3, 4), vec![1, 2, 3, 255]);
        assert_eq!(extract_alpha(&RGBA_2X1), vec![10, 20]);
    }
}
