// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for bridge operations.
//!
//! This module defines the error type returned by the fallible (`try_*`)
//! operations of [`crate::Bridge`] and by [`crate::Backend`] implementations.
//! The boolean public operations are thin wrappers that log these errors once.

use crate::Direction;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// The first three categories abort the current `setup` call and leave the
/// session torn down. The last two are handled locally and never affect the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The bus connection could not be established.
    EnvironmentUnavailable,
    /// The caller asked for something that cannot work (no stream, bad size).
    ConfigurationInvalid,
    /// A stream could not be created or connected.
    ConnectFailure,
    /// A single frame was rejected; the session keeps running.
    FormatMismatch,
    /// A guard failed because the session is not in the required state.
    NotReady,
}

/// Errors that can occur when using the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither the publish nor the capture direction was requested.
    #[error("No stream direction requested")]
    NoStreamsRequested,

    /// The supplied video configuration is out of the supported bounds.
    #[error("Invalid video config: {0}")]
    InvalidConfig(String),

    /// A bus-side handle (main loop, context, core, registry) could not be acquired.
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// A stream failed to be created or connected.
    #[error("Failed to connect {direction} stream: {reason}")]
    StreamConnect {
        /// Which stream failed.
        direction: Direction,
        /// Backend supplied reason.
        reason: String,
    },

    /// Input pixels carry a channel count other than 3 or 4.
    #[error("Unsupported pixel layout with {0} channel(s), expected 3 or 4")]
    UnsupportedChannels(usize),

    /// Input pixels are empty or were never allocated.
    #[error("Pixel buffer is not allocated")]
    Unallocated,

    /// The operation needs an initialized session.
    #[error("Bridge is not initialized")]
    NotInitialized,

    /// The operation targets a direction that was not enabled at setup.
    #[error("{0} stream is not enabled")]
    DirectionDisabled(Direction),

    /// A pixel format name could not be parsed.
    #[error("Unknown pixel format \"{0}\"")]
    UnknownPixelFormat(String),

    /// Reading a configuration file failed.
    #[error("Reading config: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document is not valid JSON for [`crate::config::BridgeConfig`].
    #[error("Parsing config: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors reported by libpipewire.
    #[cfg(feature = "pipewire")]
    #[error("PipeWire: {0}")]
    PipeWire(#[from] pipewire::Error),

    /// A generic error for failures not covered by the other variants.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Classifies this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use pwbridge::{Error, ErrorCategory};
    ///
    /// assert_eq!(Error::NoStreamsRequested.category(), ErrorCategory::ConfigurationInvalid);
    /// assert_eq!(Error::UnsupportedChannels(2).category(), ErrorCategory::FormatMismatch);
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::BusUnavailable(_) => ErrorCategory::EnvironmentUnavailable,
            #[cfg(feature = "pipewire")]
            Error::PipeWire(_) => ErrorCategory::EnvironmentUnavailable,
            Error::NoStreamsRequested
            | Error::InvalidConfig(_)
            | Error::UnknownPixelFormat(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorCategory::ConfigurationInvalid,
            Error::StreamConnect { .. } | Error::Other(_) => ErrorCategory::ConnectFailure,
            Error::UnsupportedChannels(_) | Error::Unallocated => ErrorCategory::FormatMismatch,
            Error::NotInitialized | Error::DirectionDisabled(_) => ErrorCategory::NotReady,
        }
    }
}
