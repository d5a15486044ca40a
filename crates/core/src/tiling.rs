//! Padding and tile-grid geometry.

use serde::{Deserialize, Serialize};

/// Result of rounding an image up to a whole number of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddedDimensions {
    pub width: usize,
    pub height: usize,
    pub pad_right: usize,
    pub pad_bottom: usize,
}

/// Number of tiles along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    pub x: usize,
    pub y: usize,
}

impl TileGrid {
    pub fn tile_count(&self) -> usize {
        self.x * self.y
    }
}

/// Smallest non-negative amount that brings `size` to a multiple of `tile`.
pub fn padding_for(size: usize, tile: usize) -> usize {
    if tile == 0 {
        return 0;
    }
    (tile - size % tile) % tile
}

pub fn padded_dimensions(width: usize, height: usize, tile: usize) -> PaddedDimensions {
    let pad_right = padding_for(width, tile);
    let pad_bottom = padding_for(height, tile);
    PaddedDimensions {
        width: width + pad_right,
        height: height + pad_bottom,
        pad_right,
        pad_bottom,
    }
}

pub fn tile_grid(width: usize, height: usize, tile: usize) -> TileGrid {
    let padded = padded_dimensions(width, height, tile);
    TileGrid {
        x: padded.width / tile,
        y: padded.height / tile,
    }
}

/// Copy an interleaved image into a zero-filled buffer of the padded size.
///
/// Padding is added on the right and bottom edges only, so pixel `(x, y)` of
/// the source keeps its coordinates in the result.
pub fn padded_image_data(
    pixels: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    tile: usize,
) -> (Vec<u8>, PaddedDimensions) {
    let padded = padded_dimensions(width, height, tile);
    if padded.pad_right == 0 && padded.pad_bottom == 0 {
        return (pixels.to_vec(), padded);
    }

    let src_stride = width * channels;
    let dst_stride = padded.width * channels;
    let mut out = vec![0u8; dst_stride * padded.height];
    for (src_row, dst_row) in pixels
        .chunks_exact(src_stride)
        .zip(out.chunks_exact_mut(dst_stride))
        .take(height)
    {
        dst_row[..src_stride].copy_from_slice(src_row);
    }

    (out, padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(64, 64), 0);
        assert_eq!(padding_for(65, 64), 63);
        assert_eq!(padding_for(130, 64), 62);
        assert_eq!(padding_for(1, 4), 3);
        assert_eq!(padding_for(0, 4), 0);
    }

    #[test]
    fn test_padded_dimensions_is_minimal_multiple() {
        for tile in 1..=17 {
            for w in 1..=40 {
                for h in [1, 7, 33] {
                    let p = padded_dimensions(w, h, tile);
                    assert_eq!(p.width % tile, 0);
                    assert_eq!(p.height % tile, 0);
                    assert!(p.pad_right < tile);
                    assert!(p.pad_bottom < tile);
                    assert_eq!(p.width, w + p.pad_right);
                    assert_eq!(p.height, h + p.pad_bottom);
                }
            }
        }
    }

    #[test]
    fn test_130_by_130_pads_to_three_tiles_per_axis() {
        let p = padded_dimensions(130, 130, 64);
        assert_eq!((p.width, p.height), (192, 192));
        assert_eq!(tile_grid(130, 130, 64), TileGrid { x: 3, y: 3 });
        assert_eq!(tile_grid(130, 130, 64).tile_count(), 9);
    }

    #[test]
    fn test_padded_image_data_keeps_pixels_and_zero_fills() {
        // 3x2 single-channel image padded to 4x4.
        let pixels = vec![1, 2, 3, 4, 5, 6];
        let (out, p) = padded_image_data(&pixels, 3, 2, 1, 4);
        assert_eq!((p.width, p.height), (4, 4));
        assert_eq!(
            out,
            vec![1, 2, 3, 0, 4, 5, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_padded_image_data_no_padding_is_identity() {
        let pixels: Vec<u8> = (0..32).collect();
        let (out, p) = padded_image_data(&pixels, 2, 4, 4, 2);
        assert_eq!(p.pad_right, 0);
        assert_eq!(p.pad_bottom, 0);
        assert_eq!(out, pixels);
    }
}
