//! Reassembly of per-chunk inference outputs.
//!
//! [`OutputData`] accumulates image and tensor results in chunk order and is
//! finalized exactly once by [`OutputData::finish`], which crops tile padding
//! and restores a held-back alpha channel. After `finish` every mutating call
//! is a no-op.

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::resize::{resize_image, ResizeAlgorithm};
use crate::slicer::{AlphaPlane, InsertStrategy, SlicePlan};
use crate::types::{Axis, ImageData, Layout, TensorBuffer, RGBA_CHANNELS};

#[derive(Debug, Clone)]
pub struct OutputData {
    image: ImageData,
    tensor: Option<TensorBuffer>,
    tensor_dims: Option<[usize; 4]>,
    multiplier: Option<f64>,
    layout: Layout,
    plan: SlicePlan,
    tile_pos: (usize, usize),
    tile_output: Option<(usize, usize)>,
    finished: bool,
}

impl OutputData {
    /// Empty accumulator for the chunks described by `plan`.
    pub fn new(plan: SlicePlan, layout: Layout) -> Self {
        Self {
            image: ImageData::default(),
            tensor: None,
            tensor_dims: None,
            multiplier: None,
            layout,
            plan,
            tile_pos: (0, 0),
            tile_output: None,
            finished: false,
        }
    }

    pub fn image(&self) -> &ImageData {
        &self.image
    }

    pub fn tensor(&self) -> Option<&TensorBuffer> {
        self.tensor.as_ref()
    }

    pub fn tensor_dims(&self) -> Option<[usize; 4]> {
        self.tensor_dims
    }

    /// Output width over input width; set by [`finish`](Self::finish).
    pub fn multiplier(&self) -> Option<f64> {
        self.multiplier
    }

    pub fn strategy(&self) -> InsertStrategy {
        self.plan.strategy
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_parts(self) -> (ImageData, Option<TensorBuffer>, Option<[usize; 4]>) {
        (self.image, self.tensor, self.tensor_dims)
    }

    /// Place one chunk's image output according to the insertion strategy.
    pub fn insert_image_chunk(&mut self, chunk: ImageData) -> Result<(), PipelineError> {
        if self.finished {
            return Ok(());
        }
        if !chunk.is_consistent() {
            return Err(PipelineError::InvalidInputShape(format!(
                "chunk output holds {} bytes, expected {}",
                chunk.data.len(),
                chunk.expected_len()
            )));
        }

        match self.plan.strategy {
            InsertStrategy::Vertical => self.insert_vertical(chunk),
            InsertStrategy::Tile { grid, .. } => self.insert_tile(chunk, grid.x, grid.y),
        }
    }

    fn insert_vertical(&mut self, chunk: ImageData) -> Result<(), PipelineError> {
        if self.image.height == 0 {
            self.image = chunk;
            return Ok(());
        }
        if chunk.width != self.image.width || chunk.channels != self.image.channels {
            return Err(PipelineError::InvalidInputShape(format!(
                "strip is {}x{} with {} channels, accumulated image is {} wide with {}",
                chunk.width, chunk.height, chunk.channels, self.image.width, self.image.channels
            )));
        }

        self.image.data.extend_from_slice(&chunk.data);
        self.image.height += chunk.height;
        Ok(())
    }

    fn insert_tile(
        &mut self,
        chunk: ImageData,
        grid_x: usize,
        grid_y: usize,
    ) -> Result<(), PipelineError> {
        let (tile_w, tile_h) = match self.tile_output {
            Some(size) => size,
            None => {
                let size = (chunk.width, chunk.height);
                self.image = ImageData::new(
                    vec![0; grid_x * size.0 * grid_y * size.1 * chunk.channels],
                    grid_x * size.0,
                    grid_y * size.1,
                    chunk.channels,
                );
                self.tile_output = Some(size);
                size
            }
        };

        if (chunk.width, chunk.height) != (tile_w, tile_h) || chunk.channels != self.image.channels
        {
            return Err(PipelineError::InvalidInputShape(format!(
                "tile output is {}x{}, expected {tile_w}x{tile_h}",
                chunk.width, chunk.height
            )));
        }

        let (tx, ty) = self.tile_pos;
        if ty >= grid_y {
            return Err(PipelineError::InvalidInputShape(format!(
                "received more than {} tiles",
                grid_x * grid_y
            )));
        }

        let channels = self.image.channels;
        let dst_stride = self.image.width * channels;
        let row_bytes = tile_w * channels;
        for (row, src) in chunk.data.chunks_exact(row_bytes).enumerate() {
            let start = (ty * tile_h + row) * dst_stride + tx * row_bytes;
            self.image.data[start..start + row_bytes].copy_from_slice(src);
        }

        self.tile_pos = if tx + 1 >= grid_x { (0, ty + 1) } else { (tx + 1, ty) };
        Ok(())
    }

    /// Append one chunk's raw output tensor along the height axis.
    ///
    /// Only strips are merged; tile runs keep no assembled tensor.
    pub fn insert_tensor_chunk(
        &mut self,
        chunk: TensorBuffer,
        dims: [usize; 4],
    ) -> Result<(), PipelineError> {
        if self.finished || !matches!(self.plan.strategy, InsertStrategy::Vertical) {
            return Ok(());
        }
        if chunk.len() != dims.iter().product::<usize>() {
            return Err(PipelineError::TensorMismatch {
                fields: vec![format!(
                    "elements ({} for dims {dims:?})",
                    chunk.len()
                )],
            });
        }

        let (acc, acc_dims) = match (self.tensor.take(), self.tensor_dims) {
            (Some(acc), Some(acc_dims)) => (acc, acc_dims),
            _ => {
                self.tensor = Some(chunk);
                self.tensor_dims = Some(dims);
                return Ok(());
            }
        };

        let h = self.layout.index_of(Axis::H);
        let mismatched: Vec<String> = (0..4)
            .filter(|&i| i != h && acc_dims[i] != dims[i])
            .map(|i| format!("dim {i} ({} vs {})", acc_dims[i], dims[i]))
            .collect();
        if !mismatched.is_empty() {
            self.tensor = Some(acc);
            return Err(PipelineError::TensorMismatch { fields: mismatched });
        }

        let outer: usize = acc_dims[..h].iter().product();
        let acc_block: usize = acc_dims[h..].iter().product();
        let chunk_block: usize = dims[h..].iter().product();

        let merged = match (acc, chunk) {
            (TensorBuffer::F32(a), TensorBuffer::F32(b)) => {
                TensorBuffer::F32(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::F64(a), TensorBuffer::F64(b)) => {
                TensorBuffer::F64(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::I8(a), TensorBuffer::I8(b)) => {
                TensorBuffer::I8(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::U8(a), TensorBuffer::U8(b)) => {
                TensorBuffer::U8(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::U16(a), TensorBuffer::U16(b)) => {
                TensorBuffer::U16(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::I32(a), TensorBuffer::I32(b)) => {
                TensorBuffer::I32(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (TensorBuffer::U32(a), TensorBuffer::U32(b)) => {
                TensorBuffer::U32(merge_blocks(&a, &b, outer, acc_block, chunk_block))
            }
            (a, b) => {
                let fields = vec![format!("element type ({} vs {})", a.kind(), b.kind())];
                self.tensor = Some(a);
                return Err(PipelineError::TensorMismatch { fields });
            }
        };

        let mut merged_dims = acc_dims;
        merged_dims[h] += dims[h];
        self.tensor = Some(merged);
        self.tensor_dims = Some(merged_dims);
        Ok(())
    }

    /// Finalize the output. Runs once; later calls return immediately.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let multiplier = match (self.plan.strategy, self.tile_output) {
            (InsertStrategy::Tile { tile_size, .. }, Some((tile_w, _))) => {
                tile_w as f64 / tile_size as f64
            }
            _ if self.plan.source_width > 0 => {
                self.image.width as f64 / self.plan.source_width as f64
            }
            _ => 1.0,
        };
        self.multiplier = Some(multiplier);

        if let (InsertStrategy::Tile { .. }, Some((pre_w, pre_h))) =
            (self.plan.strategy, self.plan.pre_padding)
        {
            let crop_w = ((pre_w as f64 * multiplier).round() as usize).min(self.image.width);
            let crop_h = ((pre_h as f64 * multiplier).round() as usize).min(self.image.height);
            self.crop(crop_w, crop_h);
        }

        if let Some(alpha) = self.plan.alpha.take() {
            self.restore_alpha(&alpha);
        }

        if let Some(dims) = self.tensor_dims {
            let channels = self.layout.extent(&dims, Axis::C);
            let height = self.layout.extent(&dims, Axis::H);
            let width = self.layout.extent(&dims, Axis::W);
            self.tensor_dims = Some(self.layout.dims(1, channels, height, width));
        }

        debug!(
            width = self.image.width,
            height = self.image.height,
            multiplier,
            "Output assembled"
        );
    }

    fn crop(&mut self, width: usize, height: usize) {
        if width == self.image.width && height == self.image.height {
            return;
        }
        let channels = self.image.channels;
        let src_stride = self.image.width * channels;
        let dst_stride = width * channels;
        let mut data = Vec::with_capacity(dst_stride * height);
        for row in self.image.data.chunks_exact(src_stride).take(height) {
            data.extend_from_slice(&row[..dst_stride]);
        }
        self.image = ImageData::new(data, width, height, channels);
    }

    fn restore_alpha(&mut self, alpha: &AlphaPlane) {
        if self.image.channels != RGBA_CHANNELS || self.image.data.is_empty() {
            warn!(
                channels = self.image.channels,
                "Output has no alpha slot; retained alpha dropped"
            );
            return;
        }

        let (w, h) = (self.image.width, self.image.height);
        let plane = if (alpha.width, alpha.height) == (w, h) {
            alpha.data.clone()
        } else if alpha.width == 0 || alpha.height == 0 {
            return;
        } else {
            // A uniform integer scale maps every source pixel to a square block.
            let uniform = w % alpha.width == 0
                && h % alpha.height == 0
                && w / alpha.width == h / alpha.height;
            let algorithm = if uniform {
                ResizeAlgorithm::Nearest
            } else {
                ResizeAlgorithm::Bilinear
            };
            let plane = ImageData::new(alpha.data.clone(), alpha.width, alpha.height, 1);
            resize_image(&plane, w, h, algorithm).data
        };

        for (pixel, a) in self.image.data.chunks_exact_mut(RGBA_CHANNELS).zip(plane) {
            pixel[3] = a;
        }
    }
}

/// Interleave two buffers block by block: for each of `outer` groups, the
/// accumulated block followed by the new one.
fn merge_blocks<T: Copy>(
    acc: &[T],
    chunk: &[T],
    outer: usize,
    acc_block: usize,
    chunk_block: usize,
) -> Vec<T> {
    let mut merged = Vec::with_capacity(acc.len() + chunk.len());
    for o in 0..outer {
        merged.extend_from_slice(&acc[o * acc_block..(o + 1) * acc_block]);
        merged.extend_from_slice(&chunk[o * chunk_block..(o + 1) * chunk_block]);
    }
    merged
}
