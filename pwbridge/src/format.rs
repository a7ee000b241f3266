// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Format negotiation.
//!
//! When a stream connects it offers a [`FormatProposal`]: raw video with a
//! choice of pixel formats, a size range anchored at the configured size and
//! a frame-rate range anchored at the configured rate. The bus answers with a
//! concrete [`AcceptedFormat`], which becomes the direction's
//! [`NegotiatedVideo`]. The bus may renegotiate at any time; the latest
//! accepted format always wins.

use crate::{PixelFormat, config::VideoConfig, convert::BYTES_PER_PIXEL};

/// Smallest frame size offered to the bus.
pub const MIN_SIZE: Size = Size {
    width: 16,
    height: 16,
};

/// Largest frame size offered to the bus.
pub const MAX_SIZE: Size = Size {
    width: 8192,
    height: 8192,
};

/// Lowest frame rate offered to the bus, in frames per second.
pub const MIN_FPS: u32 = 1;

/// Highest frame rate offered to the bus, in frames per second.
pub const MAX_FPS: u32 = 240;

/// Rational number, used for frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fraction {
    /// Numerator.
    pub num: u32,
    /// Denominator; zero means "unknown".
    pub denom: u32,
}

impl Fraction {
    /// Creates `num / denom`.
    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    /// Integer part of the rate, `0` when the denominator is zero.
    pub fn whole(self) -> u32 {
        if self.denom == 0 {
            0
        } else {
            self.num / self.denom
        }
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// A set of values the bus may choose from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice<T> {
    /// Any one of `alternatives`; `default` is the preferred one and is
    /// also the first alternative.
    Enum {
        /// Preferred value.
        default: T,
        /// Every acceptable value, in preference order.
        alternatives: Vec<T>,
    },
    /// Any value between `min` and `max` inclusive, `default` preferred.
    Range {
        /// Preferred value.
        default: T,
        /// Lower bound.
        min: T,
        /// Upper bound.
        max: T,
    },
}

impl<T> Choice<T> {
    /// The preferred value of the choice.
    pub fn preferred(&self) -> &T {
        match self {
            Choice::Enum { default, .. } | Choice::Range { default, .. } => default,
        }
    }
}

/// EnumFormat parameter offered when connecting a stream.
///
/// The media type is always `video/raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProposal {
    /// Pixel formats in preference order.
    pub formats: Choice<PixelFormat>,
    /// Frame size range.
    pub size: Choice<Size>,
    /// Frame rate range.
    pub framerate: Choice<Fraction>,
}

/// Builds the proposal for a stream.
///
/// An empty `preferred` list falls back to
/// [`PixelFormat::DEFAULT_PREFERENCE`].
///
/// # Examples
///
/// ```
/// use pwbridge::{PixelFormat, VideoConfig, format::{propose, Choice}};
///
/// let proposal = propose(&[PixelFormat::Bgra], &VideoConfig::new(640, 360, 30));
/// assert_eq!(*proposal.formats.preferred(), PixelFormat::Bgra);
/// assert!(matches!(proposal.size, Choice::Range { .. }));
/// ```
pub fn propose(preferred: &[PixelFormat], config: &VideoConfig) -> FormatProposal {
    let alternatives = if preferred.is_empty() {
        PixelFormat::DEFAULT_PREFERENCE.to_vec()
    } else {
        preferred.to_vec()
    };
    FormatProposal {
        formats: Choice::Enum {
            default: alternatives[0],
            alternatives,
        },
        size: Choice::Range {
            default: Size {
                width: config.width,
                height: config.height,
            },
            min: MIN_SIZE,
            max: MAX_SIZE,
        },
        framerate: Choice::Range {
            default: Fraction::new(config.fps, 1),
            min: Fraction::new(MIN_FPS, 1),
            max: Fraction::new(MAX_FPS, 1),
        },
    }
}

/// Concrete format picked by the bus, as parsed from a format-changed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedFormat {
    /// Selected pixel format.
    pub format: PixelFormat,
    /// Selected width.
    pub width: u32,
    /// Selected height.
    pub height: u32,
    /// Selected frame rate.
    pub framerate: Fraction,
    /// Row stride in bytes, `0` if the bus did not report one.
    pub stride: u32,
}

/// Format agreed with the bus for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedVideo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Whole frames per second, `0` if unknown.
    pub frame_rate: u32,
    /// Packed pixel layout on the bus.
    pub format: PixelFormat,
    /// Bytes between the starts of consecutive rows.
    pub stride: u32,
    /// `false` until the bus has confirmed a format.
    pub valid: bool,
}

impl NegotiatedVideo {
    /// Provisional format used until the bus confirms one.
    ///
    /// Uses the configured size and rate, the first preferred pixel format and
    /// a tightly packed stride so buffers can be exchanged before
    /// negotiation completes.
    pub fn provisional(config: &VideoConfig, preferred: &[PixelFormat]) -> Self {
        Self {
            width: config.width,
            height: config.height,
            frame_rate: config.fps,
            format: preferred
                .first()
                .copied()
                .unwrap_or(PixelFormat::DEFAULT_PREFERENCE[0]),
            stride: config.width * BYTES_PER_PIXEL as u32,
            valid: false,
        }
    }

    /// Interprets a format confirmed by the bus.
    ///
    /// A zero stride falls back to `width * 4`; a zero rate denominator yields
    /// a frame rate of `0`.
    pub fn accept(accepted: &AcceptedFormat) -> Self {
        let packed = accepted.width * BYTES_PER_PIXEL as u32;
        Self {
            width: accepted.width,
            height: accepted.height,
            frame_rate: accepted.framerate.whole(),
            format: accepted.format,
            stride: if accepted.stride == 0 {
                packed
            } else {
                accepted.stride.max(packed)
            },
            valid: true,
        }
    }

    /// Bytes of pixel data in one row (without stride padding).
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Bytes a bus buffer must hold for one frame at this stride.
    pub fn frame_bytes(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_is_anchored_at_config() {
        let proposal = propose(&[], &VideoConfig::new(640, 360, 30));
        assert_eq!(
            proposal.formats,
            Choice::Enum {
                default: PixelFormat::Rgbx,
                alternatives: PixelFormat::DEFAULT_PREFERENCE.to_vec(),
            }
        );
        assert_eq!(
            proposal.size,
            Choice::Range {
                default: Size {
                    width: 640,
                    height: 360
                },
                min: MIN_SIZE,
                max: MAX_SIZE,
            }
        );
        assert_eq!(*proposal.framerate.preferred(), Fraction::new(30, 1));
    }

    #[test]
    fn provisional_uses_first_preference() {
        let video = NegotiatedVideo::provisional(
            &VideoConfig::new(320, 240, 25),
            &[PixelFormat::Bgra, PixelFormat::Rgba],
        );
        assert_eq!(video.format, PixelFormat::Bgra);
        assert_eq!(video.stride, 1280);
        assert!(!video.valid);
    }

    #[test]
    fn accept_falls_back_on_zero_stride_and_rate() {
        let video = NegotiatedVideo::accept(&AcceptedFormat {
            format: PixelFormat::Bgrx,
            width: 100,
            height: 50,
            framerate: Fraction::new(30, 0),
            stride: 0,
        });
        assert_eq!(video.stride, 400);
        assert_eq!(video.frame_rate, 0);
        assert!(video.valid);
    }

    #[test]
    fn accept_keeps_padded_stride() {
        let video = NegotiatedVideo::accept(&AcceptedFormat {
            format: PixelFormat::Rgba,
            width: 100,
            height: 50,
            framerate: Fraction::new(60000, 1001),
            stride: 512,
        });
        assert_eq!(video.stride, 512);
        assert_eq!(video.frame_rate, 59);
        assert_eq!(video.frame_bytes(), 512 * 50);
    }
}
