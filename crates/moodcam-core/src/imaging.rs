//! Image plumbing: decode/encode, grayscale resize and crop, data URLs.
//!
//! Everything the detector and classifier need between "bytes arrived" and
//! "tensor ready": the heavy lifting (JPEG/PNG codecs) is delegated to the
//! `image` crate, the grayscale routines operate on plain `&[u8]` buffers
//! with explicit dimensions.

use crate::types::FaceRect;
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
    #[error("not a base64 data URL (missing comma separator)")]
    MalformedDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode an uploaded/fetched image from its encoded bytes.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    image::load_from_memory(bytes).map_err(ImagingError::Decode)
}

/// Encode an RGB image as JPEG at the given quality (1-100, clamped).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImagingError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .map_err(ImagingError::Encode)?;
    Ok(buf.into_inner())
}

/// Wrap JPEG bytes as a browser-ready `data:image/jpeg;base64,…` URL.
pub fn to_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(jpeg)
    )
}

/// Extract the raw bytes from a `data:*;base64,…` URL.
///
/// The media type before the comma is not validated; the decoder downstream
/// sniffs the actual format. Camera snapshots arrive as `image/jpeg` or
/// `image/png` depending on the browser.
pub fn from_data_url(data_url: &str) -> Result<Vec<u8>, ImagingError> {
    let (_, payload) = data_url
        .split_once(',')
        .ok_or(ImagingError::MalformedDataUrl)?;
    Ok(general_purpose::STANDARD.decode(payload.trim())?)
}

/// Resize a grayscale buffer with bilinear interpolation.
///
/// Used for both the detector's pyramid levels and the classifier's 48×48
/// crop. Sampling is center-aligned for sub-pixel accuracy.
pub fn resize_gray_bilinear(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Vec<u8> {
    let (sw, sh) = (src_w as usize, src_h as usize);
    let (dw, dh) = (dst_w as usize, dst_h as usize);
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 || src.len() < sw * sh {
        return vec![0; dw * dh];
    }

    let scale_x = sw as f32 / dw as f32;
    let scale_y = sh as f32 / dh as f32;
    let mut out = vec![0u8; dw * dh];

    for y in 0..dh {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, sh as i32 - 1) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dw {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, sw as i32 - 1) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * sw + x0] as f32;
            let tr = src[y0 * sw + x1] as f32;
            let bl = src[y1 * sw + x0] as f32;
            let br = src[y1 * sw + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out[y * dw + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Copy a rectangular region out of a grayscale buffer.
///
/// The rect must already be clamped to the image (see
/// [`FaceRect::clamped_to`]); rows outside the buffer are a programming
/// error and yield zeros rather than a panic.
pub fn crop_gray(src: &[u8], src_w: u32, rect: &FaceRect) -> Vec<u8> {
    let sw = src_w as usize;
    let (cw, ch) = (rect.width as usize, rect.height as usize);
    let (ox, oy) = (rect.x.max(0) as usize, rect.y.max(0) as usize);
    let mut out = vec![0u8; cw * ch];
    for row in 0..ch {
        let src_start = (oy + row) * sw + ox;
        let src_end = src_start + cw;
        if src_end <= src.len() {
            out[row * cw..(row + 1) * cw].copy_from_slice(&src[src_start..src_end]);
        }
    }
    out
}
