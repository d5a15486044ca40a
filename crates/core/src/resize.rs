//! Pure-Rust bilinear/nearest-neighbor resizing of interleaved 8-bit buffers.

use crate::types::ImageData;

/// Supported resize algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

/// Resize an image to `dst_w x dst_h`, keeping its channel count.
pub fn resize_image(
    image: &ImageData,
    dst_w: usize,
    dst_h: usize,
    algorithm: ResizeAlgorithm,
) -> ImageData {
    let data = match algorithm {
        ResizeAlgorithm::Bilinear => resize_bilinear(
            &image.data,
            image.width,
            image.height,
            image.channels,
            dst_w,
            dst_h,
        ),
        ResizeAlgorithm::Nearest => resize_nearest(
            &image.data,
            image.width,
            image.height,
            image.channels,
            dst_w,
            dst_h,
        ),
    };
    ImageData::new(data, dst_w, dst_h, image.channels)
}

/// Nearest-neighbor resize for interleaved data with `channels` samples per pixel.
pub fn resize_nearest(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];
    if src_w == 0 || src_h == 0 {
        return dst;
    }

    for dst_y in 0..dst_h {
        let src_y = ((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize;
        let src_y = src_y.min(src_h - 1);

        for dst_x in 0..dst_w {
            let src_x = ((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize;
            let src_x = src_x.min(src_w - 1);

            let si = (src_y * src_w + src_x) * channels;
            let di = (dst_y * dst_w + dst_x) * channels;
            dst[di..di + channels].copy_from_slice(&src[si..si + channels]);
        }
    }

    dst
}

/// Bilinear interpolation resize for interleaved data with `channels` samples per pixel.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];
    if src_w == 0 || src_h == 0 {
        return dst;
    }

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = (src_yf.floor().max(0.0) as usize).min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * channels;

            for c in 0..channels {
                let p00 = src[(src_y0 * src_w + src_x0) * channels + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * channels + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * channels + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * channels + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
