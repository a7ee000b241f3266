// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Single-slot, latest-wins frame handoff.
//!
//! One [`FrameSlot`] exists per direction. The writer replaces the frame, the
//! reader copies it out; both hold the slot's lock for the whole operation so
//! a reader never observes a half-written frame.

use std::sync::{Mutex, MutexGuard};

use crate::{Pixels, PixelFormat, convert::BYTES_PER_PIXEL};

/// Frame stored in a [`FrameSlot`].
///
/// `data` is tightly packed (`width * 4` bytes per row) in `format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width of `data` in pixels.
    pub width: u32,
    /// Height of `data` in pixels.
    pub height: u32,
    /// Layout of `data`.
    pub format: PixelFormat,
    /// Pixel bytes.
    pub data: Vec<u8>,
    /// Set once a complete frame has been written.
    pub has_data: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Rgba,
            data: Vec::new(),
            has_data: false,
        }
    }

    /// Resizes the storage for a `width` x `height` frame in `format`.
    ///
    /// Returns `true` if the dimensions changed. Reallocation keeps
    /// `has_data` untouched; callers set it after writing.
    pub fn ensure(&mut self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.format = format;
        if self.width == width && self.height == height {
            return false;
        }
        self.width = width;
        self.height = height;
        self.data
            .resize(width as usize * height as usize * BYTES_PER_PIXEL, 0);
        true
    }

    /// Bytes per row of `data`.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }
}

/// Mutex-guarded single-frame mailbox.
#[derive(Debug)]
pub struct FrameSlot {
    frame: Mutex<Frame>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(Frame::empty()),
        }
    }

    /// Locks the slot.
    ///
    /// A poisoned lock is recovered: the frame is plain bytes and remains
    /// usable after a panicking writer.
    pub fn lock(&self) -> MutexGuard<'_, Frame> {
        self.frame
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copies the current RGBA frame into `out`.
    ///
    /// Returns `false`, leaving `out` untouched, if nothing was written yet.
    /// The frame stays in the slot; repeated calls return the same frame
    /// until it is replaced.
    pub fn copy_out(&self, out: &mut Pixels) -> bool {
        let frame = self.lock();
        if !frame.has_data {
            return false;
        }
        out.assign(frame.width, frame.height, BYTES_PER_PIXEL, &frame.data);
        true
    }
}
