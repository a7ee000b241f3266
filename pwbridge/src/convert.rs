// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Pixel format tags and conversions.
//!
//! Internally every frame handed to or from the application is 4-channel
//! RGBA. On the bus side a frame is one of four packed 32-bit layouts; this
//! module moves bytes between the two representations, row by row, honoring
//! the row stride of the bus buffer.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Pixels, Result};

/// Bytes per pixel of every supported packed layout.
pub const BYTES_PER_PIXEL: usize = 4;

/// Packed 32-bit pixel layouts negotiated with the bus.
///
/// The `x` layouts carry a padding byte instead of alpha; frames leaving
/// the bridge in those layouts get `0xFF` in that byte, and frames arriving
/// in them are given an opaque alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// R, G, B, padding.
    #[serde(rename = "RGBx")]
    Rgbx,
    /// R, G, B, A.
    #[serde(rename = "RGBA")]
    Rgba,
    /// B, G, R, padding.
    #[serde(rename = "BGRx")]
    Bgrx,
    /// B, G, R, A.
    #[serde(rename = "BGRA")]
    Bgra,
}

impl PixelFormat {
    /// Default preference order offered to the bus.
    pub const DEFAULT_PREFERENCE: [PixelFormat; 4] = [
        PixelFormat::Rgbx,
        PixelFormat::Rgba,
        PixelFormat::Bgrx,
        PixelFormat::Bgra,
    ];

    /// Returns `true` if the fourth byte carries alpha.
    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Rgba | PixelFormat::Bgra)
    }

    /// Returns `true` if red and blue are swapped relative to RGBA.
    pub fn is_bgr(self) -> bool {
        matches!(self, PixelFormat::Bgrx | PixelFormat::Bgra)
    }

    /// Canonical short name, as used by the bus and in config files.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgbx => "RGBx",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgrx => "BGRx",
            PixelFormat::Bgra => "BGRA",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    /// Parses a format name.
    ///
    /// Accepts: "RGBx", "RGBA", "BGRx" or "BGRA" (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RGBX" => Ok(PixelFormat::Rgbx),
            "RGBA" => Ok(PixelFormat::Rgba),
            "BGRX" => Ok(PixelFormat::Bgrx),
            "BGRA" => Ok(PixelFormat::Bgra),
            _ => Err(Error::UnknownPixelFormat(s.to_string())),
        }
    }
}

/// Converts one RGBA pixel into `format`.
#[inline]
fn pack_pixel(rgba: &[u8], out: &mut [u8], format: PixelFormat) {
    let alpha = if format.has_alpha() { rgba[3] } else { 0xFF };
    if format.is_bgr() {
        out[0] = rgba[2];
        out[1] = rgba[1];
        out[2] = rgba[0];
    } else {
        out[..3].copy_from_slice(&rgba[..3]);
    }
    out[3] = alpha;
}

/// Converts one `format` pixel into RGBA.
#[inline]
fn unpack_pixel(packed: &[u8], out: &mut [u8], format: PixelFormat) {
    let alpha = if format.has_alpha() { packed[3] } else { 0xFF };
    if format.is_bgr() {
        out[0] = packed[2];
        out[1] = packed[1];
        out[2] = packed[0];
    } else {
        out[..3].copy_from_slice(&packed[..3]);
    }
    out[3] = alpha;
}

/// Converts a run of RGBA pixels into `format`.
///
/// Converts `min(src.len(), dst.len()) / 4` pixels.
pub fn rgba_to_packed(src: &[u8], dst: &mut [u8], format: PixelFormat) {
    if format == PixelFormat::Rgba {
        let len = src.len().min(dst.len()) / BYTES_PER_PIXEL * BYTES_PER_PIXEL;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for (s, d) in src
        .chunks_exact(BYTES_PER_PIXEL)
        .zip(dst.chunks_exact_mut(BYTES_PER_PIXEL))
    {
        pack_pixel(s, d, format);
    }
}

/// Converts a run of `format` pixels into RGBA.
///
/// Converts `min(src.len(), dst.len()) / 4` pixels.
pub fn packed_to_rgba(src: &[u8], dst: &mut [u8], format: PixelFormat) {
    if format == PixelFormat::Rgba {
        let len = src.len().min(dst.len()) / BYTES_PER_PIXEL * BYTES_PER_PIXEL;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for (s, d) in src
        .chunks_exact(BYTES_PER_PIXEL)
        .zip(dst.chunks_exact_mut(BYTES_PER_PIXEL))
    {
        unpack_pixel(s, d, format);
    }
}

/// Converts a run of pixels between two packed layouts.
pub fn repack(src: &[u8], dst: &mut [u8], from: PixelFormat, to: PixelFormat) {
    if from == to {
        let len = src.len().min(dst.len()) / BYTES_PER_PIXEL * BYTES_PER_PIXEL;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    let mut rgba = [0u8; BYTES_PER_PIXEL];
    for (s, d) in src
        .chunks_exact(BYTES_PER_PIXEL)
        .zip(dst.chunks_exact_mut(BYTES_PER_PIXEL))
    {
        unpack_pixel(s, &mut rgba, from);
        pack_pixel(&rgba, d, to);
    }
}

/// Applies `row_op` to `rows` rows of `row_bytes` bytes each, stepping
/// through `src` and `dst` with their respective strides.
///
/// The caller guarantees both buffers hold `rows` rows at their stride.
pub fn for_each_row(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
    mut row_op: impl FnMut(&[u8], &mut [u8]),
) {
    for y in 0..rows {
        let s = &src[y * src_stride..y * src_stride + row_bytes];
        let d = &mut dst[y * dst_stride..y * dst_stride + row_bytes];
        row_op(s, d);
    }
}

/// Normalizes application pixels to a `width` x `height` RGBA image.
///
/// 3-channel input gets an opaque alpha; input of a different size is
/// resampled (nearest neighbour) first.
///
/// # Errors
///
/// Returns [`Error::Unallocated`] for empty input and
/// [`Error::UnsupportedChannels`] for anything but 3 or 4 channels.
pub fn normalize_rgba(pixels: &Pixels, width: u32, height: u32) -> Result<Pixels> {
    if !pixels.is_allocated() {
        return Err(Error::Unallocated);
    }
    let channels = pixels.channels();
    if channels != 3 && channels != 4 {
        return Err(Error::UnsupportedChannels(channels));
    }

    let resized;
    let source = if pixels.width() != width || pixels.height() != height {
        resized = resample_nearest(pixels, width, height);
        &resized
    } else {
        pixels
    };

    if channels == 4 {
        return Ok(source.clone());
    }

    let mut out = Pixels::allocate(width, height, BYTES_PER_PIXEL);
    for (s, d) in source
        .data()
        .chunks_exact(3)
        .zip(out.data_mut().chunks_exact_mut(BYTES_PER_PIXEL))
    {
        d[..3].copy_from_slice(s);
        d[3] = 0xFF;
    }
    Ok(out)
}

/// Nearest-neighbour resample to `width` x `height`, keeping the channel count.
pub fn resample_nearest(pixels: &Pixels, width: u32, height: u32) -> Pixels {
    let channels = pixels.channels();
    let mut out = Pixels::allocate(width, height, channels);
    if !pixels.is_allocated() {
        return out;
    }
    resample_into(
        pixels.data(),
        (pixels.width(), pixels.height()),
        out.data_mut(),
        (width, height),
        channels,
    );
    out
}

/// Nearest-neighbour resample of tightly packed pixels of `channels` bytes
/// from `src` (`src_size` as width, height) into `dst` (`dst_size`).
///
/// The caller guarantees both buffers hold a full image at their size.
pub fn resample_into(
    src: &[u8],
    src_size: (u32, u32),
    dst: &mut [u8],
    dst_size: (u32, u32),
    channels: usize,
) {
    let (src_w, src_h) = (src_size.0 as u64, src_size.1 as u64);
    let (width, height) = dst_size;
    if width == 0 || height == 0 || src_w == 0 || src_h == 0 {
        return;
    }
    let row_bytes = width as usize * channels;
    for (y, row) in dst.chunks_exact_mut(row_bytes).take(height as usize).enumerate() {
        let sy = (y as u64 * src_h / height as u64) as usize;
        let src_row = &src[sy * src_w as usize * channels..][..src_w as usize * channels];
        for (x, px) in row.chunks_exact_mut(channels).enumerate() {
            let sx = (x as u64 * src_w / width as u64) as usize;
            px.copy_from_slice(&src_row[sx * channels..sx * channels + channels]);
        }
    }
}
