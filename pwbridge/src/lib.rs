// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Video stream bridge to the PipeWire media bus.
//!
//! A [`Bridge`] publishes frames produced by an application as a video
//! output node, captures frames from an input node, or both. It negotiates the
//! packed pixel layout with the bus (RGBx, RGBA, BGRx or BGRA), converts to and
//! from the application's RGB/RGBA [`Pixels`], and keeps a catalog of the
//! nodes and ports discovered on the bus.
//!
//! The bus client sits behind the [`Backend`] trait:
//!
//! * `PipeWireBackend` (feature `pipewire`) talks to the session's PipeWire
//!   daemon.
//! * [`LoopbackBus`] is an in-process simulation linking the publish stream
//!   back into the capture stream.
//!
//! Key types:
//!
//! * [`Bridge`]: setup, per-tick update, frame exchange and shutdown.
//! * [`RegistryCatalog`] with [`NodeInfo`] and [`PortInfo`]: discovered objects.
//! * [`NegotiatedVideo`]: the format agreed with the bus per direction.
//! * [`config::BridgeConfig`]: JSON-loadable settings.
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod backend;
mod bridge;
pub mod config;
pub mod convert;
mod error;
pub mod format;
pub mod loopback;
pub mod mailbox;
#[cfg(feature = "pipewire")]
pub mod native;
mod pixels;
pub mod registry;
mod session;
pub mod stream;

pub use backend::{Backend, BusBuffer, ChunkMeta, Direction, EventLoop, StreamRequest};
pub use bridge::Bridge;
pub use config::{BridgeConfig, Target, VideoConfig};
pub use convert::PixelFormat;
pub use error::{Error, ErrorCategory, Result};
pub use format::{AcceptedFormat, NegotiatedVideo};
pub use loopback::LoopbackBus;
#[cfg(feature = "pipewire")]
pub use native::PipeWireBackend;
pub use pixels::Pixels;
pub use registry::{GlobalObject, GlobalType, NodeInfo, PortInfo, RegistryCatalog};
pub use stream::StreamState;
