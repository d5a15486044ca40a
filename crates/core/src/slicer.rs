//! Splits a decoded image into inference-sized chunks.
//!
//! Without a model tile size the image is cut into full-width horizontal
//! strips sized by a pixel budget ([`ChunkLevel`]). With a tile size it is
//! zero-padded to whole tiles and cut into a row-major grid.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::model::Model;
use crate::queue::ChunkQueue;
use crate::tensor_codec::{extract_alpha, pixels_to_tensor};
use crate::tiling::{padded_image_data, TileGrid};
use crate::types::{ImageData, TensorBuffer, RGBA_CHANNELS};

/// Discrete per-chunk pixel budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ChunkLevel {
    Level1,
    #[default]
    Level2,
    Level3,
    Level4,
}

impl ChunkLevel {
    /// Map a 1-4 level, falling back to level 1 for anything else.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => Self::Level1,
            2 => Self::Level2,
            3 => Self::Level3,
            4 => Self::Level4,
            other => {
                warn!(level = other, "Chunk level must be between 1 and 4; using level 1");
                Self::Level1
            }
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
            Self::Level4 => 4,
        }
    }

    /// Target pixels per chunk.
    pub fn pixel_budget(self) -> usize {
        match self {
            Self::Level1 => 40_000,
            Self::Level2 => 160_000,
            Self::Level3 => 640_000,
            Self::Level4 => 1_440_000,
        }
    }
}

impl From<u8> for ChunkLevel {
    fn from(level: u8) -> Self {
        Self::from_level(level)
    }
}

impl From<ChunkLevel> for u8 {
    fn from(level: ChunkLevel) -> Self {
        level.level()
    }
}

/// What a chunk carries into inference.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    /// Interleaved 8-bit pixels, converted to a tensor right before inference.
    Pixels { data: Vec<u8>, channels: usize },
    /// Tensor already in the model's layout and element type.
    Tensor(TensorBuffer),
}

/// One unit of inference work.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub index: usize,
    pub payload: ChunkPayload,
    pub width: usize,
    pub height: usize,
    /// Input dimensions placed according to the model layout.
    pub dims: [usize; 4],
}

impl ChunkData {
    /// Consume the chunk and produce the model input tensor.
    pub fn into_tensor(self, model: &Model) -> Result<TensorBuffer, PipelineError> {
        match self.payload {
            ChunkPayload::Pixels { data, channels } => {
                pixels_to_tensor(&data, channels, self.width, self.height, model)
            }
            ChunkPayload::Tensor(tensor) => Ok(tensor),
        }
    }
}

/// How chunk outputs must be put back together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InsertStrategy {
    Vertical,
    Tile { grid: TileGrid, tile_size: usize },
}

/// Alpha bytes held back from a 4-channel input fed to a 3-channel model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaPlane {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Bookkeeping the assembler needs to reverse a slicing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicePlan {
    pub strategy: InsertStrategy,
    /// Width of the buffer chunks were cut from (padded width for tiles).
    pub source_width: usize,
    pub source_height: usize,
    /// Image size before tile padding.
    pub pre_padding: Option<(usize, usize)>,
    pub alpha: Option<AlphaPlane>,
}

#[derive(Debug)]
pub struct SliceResult {
    pub queue: ChunkQueue,
    pub plan: SlicePlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slicer {
    chunk_size: usize,
    preserve_alpha: bool,
}

impl Default for Slicer {
    fn default() -> Self {
        Self::new(ChunkLevel::default())
    }
}

impl Slicer {
    pub fn new(level: ChunkLevel) -> Self {
        Self {
            chunk_size: level.pixel_budget(),
            preserve_alpha: true,
        }
    }

    /// Use an explicit pixel budget instead of a level.
    pub fn with_chunk_size(mut self, pixels: usize) -> Self {
        self.chunk_size = pixels.max(1);
        self
    }

    pub fn with_preserve_alpha(mut self, preserve: bool) -> Self {
        self.preserve_alpha = preserve;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn slice(&self, image: &ImageData, model: &Model) -> Result<SliceResult, PipelineError> {
        if !(3..=4).contains(&image.channels) {
            return Err(PipelineError::InvalidInputShape(format!(
                "expected 3 or 4 channels, got {}",
                image.channels
            )));
        }
        if image.width == 0 || image.height == 0 || !image.is_consistent() {
            return Err(PipelineError::InvalidInputShape(format!(
                "{} bytes do not describe a {}x{}x{} image",
                image.data.len(),
                image.width,
                image.height,
                image.channels
            )));
        }

        let alpha = (self.preserve_alpha
            && model.channel == 3
            && image.channels == RGBA_CHANNELS)
            .then(|| AlphaPlane {
                data: extract_alpha(&image.data),
                width: image.width,
                height: image.height,
            });

        let mut queue = ChunkQueue::new();
        if model.tile_size == Some(0) {
            return Err(PipelineError::Validation {
                fields: vec!["tileSize (must be positive)".to_string()],
            });
        }

        let plan = match model.tile_size {
            None => {
                let strips = slice_vertical(
                    &image.data,
                    image.width,
                    image.height,
                    image.channels,
                    self.chunk_size,
                );
                for (index, (data, height)) in strips.into_iter().enumerate() {
                    queue.push(ChunkData {
                        index,
                        payload: ChunkPayload::Pixels {
                            data,
                            channels: image.channels,
                        },
                        width: image.width,
                        height,
                        dims: model.chunk_dims(height, image.width),
                    });
                }
                SlicePlan {
                    strategy: InsertStrategy::Vertical,
                    source_width: image.width,
                    source_height: image.height,
                    pre_padding: None,
                    alpha,
                }
            }
            Some(tile) => {
                let tiles = slice_tiles(&image.data, image.width, image.height, image.channels, tile);
                for (index, data) in tiles.tiles.into_iter().enumerate() {
                    queue.push(ChunkData {
                        index,
                        payload: ChunkPayload::Pixels {
                            data,
                            channels: image.channels,
                        },
                        width: tile,
                        height: tile,
                        dims: model.chunk_dims(tile, tile),
                    });
                }
                SlicePlan {
                    strategy: InsertStrategy::Tile {
                        grid: tiles.grid,
                        tile_size: tile,
                    },
                    source_width: tiles.grid.x * tile,
                    source_height: tiles.grid.y * tile,
                    pre_padding: Some((image.width, image.height)),
                    alpha,
                }
            }
        };

        debug!(
            chunks = queue.len(),
            strategy = ?plan.strategy,
            width = image.width,
            height = image.height,
            alpha_retained = plan.alpha.is_some(),
            "Sliced input image"
        );

        Ok(SliceResult { queue, plan })
    }

    /// Wrap a pre-built tensor as a single chunk.
    pub fn slice_tensor(
        &self,
        tensor: TensorBuffer,
        width: usize,
        height: usize,
        model: &Model,
    ) -> SliceResult {
        let mut queue = ChunkQueue::new();
        queue.push(ChunkData {
            index: 0,
            payload: ChunkPayload::Tensor(tensor),
            width,
            height,
            dims: model.chunk_dims(height, width),
        });
        SliceResult {
            queue,
            plan: SlicePlan {
                strategy: InsertStrategy::Vertical,
                source_width: width,
                source_height: height,
                pre_padding: None,
                alpha: None,
            },
        }
    }
}

/// Cut full-width strips of roughly `chunk_size` pixels off the front of `pixels`.
///
/// Returns each strip's bytes with its height. The last strip absorbs
/// whatever rows remain.
pub fn slice_vertical(
    pixels: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    chunk_size: usize,
) -> Vec<(Vec<u8>, usize)> {
    if width * height <= chunk_size {
        return vec![(pixels.to_vec(), height)];
    }

    let chunk_height = ((chunk_size as f64 / width as f64).round() as usize).max(1);
    let row_bytes = width * channels;
    let slice_bytes = row_bytes * chunk_height;

    let mut strips = Vec::new();
    let mut rest = pixels;
    while rest.len() >= slice_bytes {
        let (head, tail) = rest.split_at(slice_bytes);
        strips.push((head.to_vec(), chunk_height));
        rest = tail;
    }
    if !rest.is_empty() {
        strips.push((rest.to_vec(), rest.len() / row_bytes));
    }

    strips
}

pub struct TileSlices {
    pub tiles: Vec<Vec<u8>>,
    pub grid: TileGrid,
}

/// Pad to whole tiles and cut the grid row-major, x fastest.
pub fn slice_tiles(
    pixels: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    tile: usize,
) -> TileSlices {
    let (padded, dims) = padded_image_data(pixels, width, height, channels, tile);
    let grid = TileGrid {
        x: dims.width / tile,
        y: dims.height / tile,
    };

    let src_stride = dims.width * channels;
    let tile_stride = tile * channels;
    let mut tiles = Vec::with_capacity(grid.tile_count());
    for ty in 0..grid.y {
        for tx in 0..grid.x {
            let mut data = Vec::with_capacity(tile_stride * tile);
            for row in 0..tile {
                let start = (ty * tile + row) * src_stride + tx * tile_stride;
                data.extend_from_slice(&padded[start..start + tile_stride]);
            }
            tiles.push(data);
        }
    }

    TileSlices { tiles, grid }
}
