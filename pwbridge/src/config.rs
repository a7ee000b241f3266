// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Session configuration.
//!
//! [`VideoConfig`] is the value handed to [`crate::Bridge::setup`].
//! [`BridgeConfig`] is an optional JSON document bundling everything a
//! program usually wires by hand: names, preferred formats, targets and the
//! stream directions to open.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    Error, PixelFormat, Result,
    format::{MAX_FPS, MAX_SIZE, MIN_FPS, MIN_SIZE},
};

/// Default application and node name.
pub const DEFAULT_NAME: &str = "pwbridge";

/// Requested video parameters, fixed for the lifetime of a session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl VideoConfig {
    /// Creates a config.
    pub const fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }

    /// Checks the config against the ranges offered to the bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the size is outside
    /// 16x16..8192x8192 or the rate outside 1..240.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SIZE.width..=MAX_SIZE.width).contains(&self.width)
            || !(MIN_SIZE.height..=MAX_SIZE.height).contains(&self.height)
        {
            return Err(Error::InvalidConfig(format!(
                "size {}x{} outside {}x{}..{}x{}",
                self.width, self.height, MIN_SIZE.width, MIN_SIZE.height, MAX_SIZE.width,
                MAX_SIZE.height
            )));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            return Err(Error::InvalidConfig(format!(
                "frame rate {} outside {}..{}",
                self.fps, MIN_FPS, MAX_FPS
            )));
        }
        Ok(())
    }
}

/// Object a stream should be linked to by the bus's autoconnect policy.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Target {
    /// `node.name` of the target node.
    #[serde(default)]
    pub node_name: Option<String>,
    /// `object.serial` of the target object; wins over `node_name`.
    #[serde(default)]
    pub object_serial: Option<String>,
}

impl Target {
    /// Value for the `target.object` stream property, if any.
    pub fn property_value(&self) -> Option<&str> {
        self.object_serial
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.node_name.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Complete bridge configuration, typically loaded from JSON.
///
/// Every field is optional in the document.
///
/// # Examples
///
/// ```
/// use pwbridge::{PixelFormat, config::BridgeConfig};
///
/// let config = BridgeConfig::from_json_str(r#"{
///     "node_name": "Studio Out",
///     "publish": true,
///     "preferred_formats": ["BGRA", "RGBA"],
///     "video": {"width": 1280, "height": 720, "fps": 60},
///     "capture_target": {"node_name": "v4l2_input.usb-cam"}
/// }"#).unwrap();
///
/// assert_eq!(config.preferred_formats[0], PixelFormat::Bgra);
/// assert!(!config.capture);
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// `application.name` of the streams.
    #[serde(default = "default_name")]
    pub app_name: String,
    /// `node.name` of the streams.
    #[serde(default = "default_name")]
    pub node_name: String,
    /// Pixel formats offered to the bus, in preference order.
    #[serde(default = "default_formats")]
    pub preferred_formats: Vec<PixelFormat>,
    /// Open the output (publish) stream.
    #[serde(default)]
    pub publish: bool,
    /// Open the input (capture) stream.
    #[serde(default)]
    pub capture: bool,
    /// Target of the publish stream.
    #[serde(default)]
    pub publish_target: Target,
    /// Target of the capture stream.
    #[serde(default)]
    pub capture_target: Target,
    /// Requested video parameters.
    #[serde(default)]
    pub video: VideoConfig,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_formats() -> Vec<PixelFormat> {
    PixelFormat::DEFAULT_PREFERENCE.to_vec()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_name: default_name(),
            node_name: default_name(),
            preferred_formats: default_formats(),
            publish: false,
            capture: false,
            publish_target: Target::default(),
            capture_target: Target::default(),
            video: VideoConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document does not match the schema.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Json`]
    /// if it cannot be parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}
