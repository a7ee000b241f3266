// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Bus client abstraction.
//!
//! A [`Backend`] hands out one guard per bus handle class. Guards release
//! their handle when dropped; [`crate::session::Session`] owns them and
//! drops them in reverse acquisition order. Notifications flow back through
//! the handler values passed at acquisition time and are only delivered
//! from inside [`EventLoop::iterate`].

use std::{collections::BTreeMap, fmt};

use crate::{
    Error, Result,
    format::FormatProposal,
    registry::RegistryHandler,
    stream::StreamHandler,
};

/// Stream direction, seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Output stream: frames submitted by the application go to the bus.
    Publish,
    /// Input stream: frames arriving from the bus go to the application.
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Publish => f.write_str("publish"),
            Direction::Capture => f.write_str("capture"),
        }
    }
}

/// Event loop owned by a session.
pub trait EventLoop {
    /// Dispatches all pending events once without blocking.
    ///
    /// Registry and stream handlers run synchronously inside this call.
    fn iterate(&self) -> Result<()>;
}

/// Everything a backend needs to create and connect one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Human readable stream name.
    pub name: String,
    /// Output or input.
    pub direction: Direction,
    /// Connection properties (`media.type`, `node.name`, `target.object`, ...).
    pub properties: BTreeMap<String, String>,
    /// EnumFormat parameter offered to the bus.
    pub proposal: FormatProposal,
}

impl StreamRequest {
    /// Checks that the name and every property can cross into C strings.
    ///
    /// # Errors
    ///
    /// [`Error::StreamConnect`] naming the first string with an interior NUL.
    pub fn check_strings(&self) -> Result<()> {
        let nul = |what: String| Error::StreamConnect {
            direction: self.direction,
            reason: format!("{what} contains a NUL byte"),
        };
        if self.name.contains('\0') {
            return Err(nul("Stream name".to_string()));
        }
        for (key, value) in &self.properties {
            if key.contains('\0') || value.contains('\0') {
                return Err(nul(format!("Property {key:?}")));
            }
        }
        Ok(())
    }
}

/// Placement of valid bytes inside a bus buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    /// Offset of the first valid byte.
    pub offset: u32,
    /// Number of valid bytes.
    pub size: u32,
    /// Bytes between row starts; `0` or negative if the producer did not say.
    pub stride: i32,
}

/// A dequeued, bus-owned buffer, valid for the duration of one process callback.
///
/// Only the first data plane is exposed.
pub trait BusBuffer {
    /// Chunk metadata, `None` if the buffer carries no chunk.
    fn chunk(&self) -> Option<ChunkMeta>;

    /// Mapped bytes of the plane, `None` if the buffer is not mapped.
    fn data_mut(&mut self) -> Option<&mut [u8]>;

    /// Updates the chunk metadata before the buffer is queued back.
    fn set_chunk(&mut self, chunk: ChunkMeta);
}

/// A bus client implementation.
///
/// Acquisition follows the dependency chain main loop, context, core,
/// registry, streams. Every method either returns a live guard or an error
/// and leaves previously acquired guards untouched.
pub trait Backend {
    /// Event loop guard.
    type MainLoop: EventLoop;
    /// Context guard.
    type Context;
    /// Core connection guard.
    type Core;
    /// Registry subscription guard.
    type Registry;
    /// Stream guard.
    type Stream;

    /// Creates the event loop.
    fn create_main_loop(&self) -> Result<Self::MainLoop>;

    /// Creates a context bound to `main_loop`.
    fn create_context(&self, main_loop: &Self::MainLoop) -> Result<Self::Context>;

    /// Connects to the bus daemon.
    fn connect_core(&self, context: &Self::Context) -> Result<Self::Core>;

    /// Subscribes to registry notifications, delivered to `handler`.
    fn get_registry(&self, core: &Self::Core, handler: RegistryHandler) -> Result<Self::Registry>;

    /// Creates a stream, registers `handler` and connects it with `request.proposal`.
    fn connect_stream(
        &self,
        core: &Self::Core,
        request: StreamRequest,
        handler: StreamHandler,
    ) -> Result<Self::Stream>;
}
