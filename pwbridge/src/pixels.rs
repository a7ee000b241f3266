// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Application-side image buffer.

use crate::{Error, Result};

/// Contiguous, row-major, 8-bit-per-channel image.
///
/// This is the buffer exchanged with the application by
/// [`crate::Bridge::submit_frame`] and [`crate::Bridge::get_latest_frame`].
/// Rows are tightly packed (`width * channels` bytes per row). The bridge
/// accepts 3-channel (RGB) and 4-channel (RGBA) images and always hands out
/// 4-channel RGBA.
///
/// # Examples
///
/// ```
/// use pwbridge::Pixels;
///
/// let mut pixels = Pixels::allocate(4, 2, 4);
/// pixels.fill(&[255, 0, 0, 255]);
/// assert_eq!(pixels.pixel(3, 1), Some(&[255, 0, 0, 255][..]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pixels {
    width: u32,
    height: u32,
    channels: usize,
    data: Vec<u8>,
}

impl Pixels {
    /// Creates an unallocated (empty) image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled image of the given size.
    pub fn allocate(width: u32, height: u32, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0; width as usize * height as usize * channels],
        }
    }

    /// Wraps existing bytes as an image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] if `data.len()` is not `width * height * channels`.
    pub fn from_raw(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * channels;
        if data.len() != expected {
            return Err(Error::Other(format!(
                "Pixel data is {} bytes, {}x{}x{} requires {}.",
                data.len(),
                width,
                height,
                channels,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of interleaved 8-bit channels per pixel.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Raw row-major bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw row-major bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns `true` when the image has a non-empty size and matching storage.
    pub fn is_allocated(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.channels > 0
            && self.data.len() == self.width as usize * self.height as usize * self.channels
    }

    /// Returns the channel bytes of the pixel at `(x, y)`, or `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * self.channels;
        self.data.get(start..start + self.channels)
    }

    /// Sets every pixel to `value`.
    ///
    /// `value` must hold exactly [`Self::channels`] bytes; otherwise the image
    /// is left unchanged.
    pub fn fill(&mut self, value: &[u8]) {
        if value.len() != self.channels || self.channels == 0 {
            return;
        }
        for px in self.data.chunks_exact_mut(self.channels) {
            px.copy_from_slice(value);
        }
    }

    /// Replaces the content with `src`, reusing the existing allocation.
    pub(crate) fn assign(&mut self, width: u32, height: u32, channels: usize, src: &[u8]) {
        self.width = width;
        self.height = height;
        self.channels = channels;
        self.data.clear();
        self.data.extend_from_slice(src);
    }
}
