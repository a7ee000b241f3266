// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! In-process simulated bus.
//!
//! [`LoopbackBus`] implements [`Backend`] without a daemon. It is what the
//! test-suite and the `loopback` demo run on, and it is handy for exercising
//! an application's bridge integration on machines without a media server.
//!
//! Behavior per [`EventLoop::iterate`]:
//!
//! 1. pending registry notifications are delivered;
//! 2. streams that are new, or were asked to [`LoopbackBus::renegotiate`],
//!    receive a format and move to streaming;
//! 3. the publish stream fills one buffer, which is then delivered to the
//!    capture stream (see [`LoopbackBus::set_linked`]);
//! 4. buffers queued with [`LoopbackBus::inject_capture_buffer`] are
//!    delivered to the capture stream.
//!
//! Handlers always run without the bus lock held.
//!
//! Clones share the same bus, so a test can keep a handle while the bridge
//! owns another.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, trace};

use crate::{
    Direction, Error, PixelFormat, Result,
    backend::{Backend, BusBuffer, ChunkMeta, EventLoop, StreamRequest},
    convert::BYTES_PER_PIXEL,
    format::{AcceptedFormat, Choice, FormatProposal},
    registry::{GlobalObject, RegistryHandler},
    stream::{StreamHandler, StreamState},
};

/// Handle classes of a bus connection, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Handle {
    /// Event loop.
    MainLoop,
    /// Context.
    Context,
    /// Core connection.
    Core,
    /// Registry subscription.
    Registry,
    /// Stream of the given direction.
    Stream(Direction),
}

/// A buffer on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoopbackBuffer {
    /// Chunk metadata; `None` models a buffer without chunk.
    pub chunk: Option<ChunkMeta>,
    /// Mapped bytes; `None` models an unmapped buffer.
    pub data: Option<Vec<u8>>,
}

impl LoopbackBuffer {
    /// Wraps tightly or loosely packed frame bytes.
    pub fn new(data: Vec<u8>, stride: i32) -> Self {
        Self {
            chunk: Some(ChunkMeta {
                offset: 0,
                size: data.len() as u32,
                stride,
            }),
            data: Some(data),
        }
    }
}

impl BusBuffer for LoopbackBuffer {
    fn chunk(&self) -> Option<ChunkMeta> {
        self.chunk
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    fn set_chunk(&mut self, chunk: ChunkMeta) {
        self.chunk = Some(chunk);
    }
}

enum RegistryEvent {
    Added(GlobalObject),
    Removed(u32),
}

struct RegistryEntry {
    id: u64,
    handler: RegistryHandler,
    pending: VecDeque<RegistryEvent>,
}

struct StreamEntry {
    id: u64,
    direction: Direction,
    handler: StreamHandler,
    proposal: FormatProposal,
    negotiated: Option<AcceptedFormat>,
    pending_format: Option<AcceptedFormat>,
    state: StreamState,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    globals: BTreeMap<u32, GlobalObject>,
    registries: Vec<RegistryEntry>,
    streams: Vec<StreamEntry>,
    failures: BTreeSet<Handle>,
    format_overrides: BTreeMap<Direction, PixelFormat>,
    stride_padding: u32,
    unlinked: bool,
    capture_queue: VecDeque<LoopbackBuffer>,
    requests: Vec<StreamRequest>,
    released: Vec<Handle>,
    last_publish: Option<LoopbackBuffer>,
}

impl BusState {
    fn acquire(&mut self, handle: Handle) -> Result<u64> {
        if self.failures.contains(&handle) {
            debug!(?handle, "Injected acquisition failure");
            return Err(match handle {
                Handle::Stream(direction) => Error::StreamConnect {
                    direction,
                    reason: "injected failure".to_string(),
                },
                other => Error::BusUnavailable(format!("injected {other:?} failure")),
            });
        }
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn negotiate(&self, entry: &StreamEntry) -> AcceptedFormat {
        let format = match (&entry.proposal.formats, self.format_overrides.get(&entry.direction)) {
            (Choice::Enum { alternatives, .. }, Some(wanted)) if alternatives.contains(wanted) => {
                *wanted
            }
            (choice, _) => *choice.preferred(),
        };
        let size = *entry.proposal.size.preferred();
        AcceptedFormat {
            format,
            width: size.width,
            height: size.height,
            framerate: *entry.proposal.framerate.preferred(),
            stride: size.width * BYTES_PER_PIXEL as u32 + self.stride_padding,
        }
    }
}

/// Simulated bus; see the module documentation.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LoopbackBus")
            .field("globals", &state.globals.len())
            .field("streams", &state.streams.len())
            .finish()
    }
}

impl LoopbackBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes an object; subscribed registries see it on their next iteration.
    pub fn announce(&self, global: GlobalObject) {
        let mut state = self.lock();
        for registry in &mut state.registries {
            registry
                .pending
                .push_back(RegistryEvent::Added(global.clone()));
        }
        state.globals.insert(global.id, global);
    }

    /// Withdraws the object with `id`.
    pub fn retract(&self, id: u32) {
        let mut state = self.lock();
        state.globals.remove(&id);
        for registry in &mut state.registries {
            registry.pending.push_back(RegistryEvent::Removed(id));
        }
    }

    /// Makes every later acquisition of `handle` fail.
    pub fn fail(&self, handle: Handle) {
        self.lock().failures.insert(handle);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Makes the bus choose `format` for `direction` when the stream offers it.
    pub fn set_format_override(&self, direction: Direction, format: PixelFormat) {
        self.lock().format_overrides.insert(direction, format);
    }

    /// Adds `bytes` of row padding to the stride of later negotiations.
    pub fn set_stride_padding(&self, bytes: u32) {
        self.lock().stride_padding = bytes;
    }

    /// Enables or disables delivering publish buffers to the capture stream.
    ///
    /// Linked by default.
    pub fn set_linked(&self, linked: bool) {
        self.lock().unlinked = !linked;
    }

    /// Forces a new format onto the open `direction` stream at the next iteration.
    ///
    /// Returns `false` if no such stream is open.
    pub fn renegotiate(&self, direction: Direction, format: AcceptedFormat) -> bool {
        let mut state = self.lock();
        match state.streams.iter_mut().find(|s| s.direction == direction) {
            Some(stream) => {
                stream.pending_format = Some(format);
                true
            }
            None => false,
        }
    }

    /// Queues a buffer for the capture stream.
    pub fn inject_capture_buffer(&self, buffer: LoopbackBuffer) {
        self.lock().capture_queue.push_back(buffer);
    }

    /// Properties of the last connect request for `direction`.
    pub fn stream_properties(&self, direction: Direction) -> Option<BTreeMap<String, String>> {
        self.lock()
            .requests
            .iter()
            .rev()
            .find(|r| r.direction == direction)
            .map(|r| r.properties.clone())
    }

    /// Every stream connect request seen so far.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.lock().requests.clone()
    }

    /// Handles released so far, in release order.
    pub fn released(&self) -> Vec<Handle> {
        self.lock().released.clone()
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.lock().streams.len()
    }

    /// Number of registry subscriptions.
    pub fn open_registries(&self) -> usize {
        self.lock().registries.len()
    }

    /// The buffer most recently filled by the publish stream.
    pub fn last_publish_buffer(&self) -> Option<LoopbackBuffer> {
        self.lock().last_publish.clone()
    }

    fn release(&self, handle: Handle) {
        trace!(?handle, "Released");
        self.lock().released.push(handle);
    }

    fn iterate(&self) {
        self.deliver_registry_events();
        self.negotiate_streams();
        self.run_publish();
        self.run_injected_captures();
    }

    fn deliver_registry_events(&self) {
        let batches: Vec<(RegistryHandler, Vec<RegistryEvent>)> = {
            let mut state = self.lock();
            state
                .registries
                .iter_mut()
                .filter(|r| !r.pending.is_empty())
                .map(|r| (r.handler.clone(), r.pending.drain(..).collect()))
                .collect()
        };
        for (handler, events) in batches {
            for event in events {
                match event {
                    RegistryEvent::Added(global) => handler.global_added(&global),
                    RegistryEvent::Removed(id) => handler.global_removed(id),
                }
            }
        }
    }

    fn negotiate_streams(&self) {
        let mut notifications = Vec::new();
        {
            let mut state = self.lock();
            let mut decided = Vec::new();
            for (index, stream) in state.streams.iter().enumerate() {
                let accepted = match (stream.pending_format, stream.negotiated) {
                    (Some(forced), _) => forced,
                    (None, None) => state.negotiate(stream),
                    (None, Some(_)) => continue,
                };
                decided.push((index, accepted));
            }
            for (index, accepted) in decided {
                let stream = &mut state.streams[index];
                stream.pending_format = None;
                stream.negotiated = Some(accepted);
                let old = std::mem::replace(&mut stream.state, StreamState::Streaming);
                notifications.push((stream.handler.clone(), accepted, old));
            }
        }
        for (handler, accepted, old) in notifications {
            if old == StreamState::Streaming {
                handler.format_changed(&accepted);
                continue;
            }
            handler.state_changed(old, StreamState::Paused);
            handler.format_changed(&accepted);
            handler.state_changed(StreamState::Paused, StreamState::Streaming);
        }
    }

    fn streaming_handler(&self, direction: Direction) -> Option<(StreamHandler, AcceptedFormat)> {
        let state = self.lock();
        state
            .streams
            .iter()
            .find(|s| s.direction == direction)
            .and_then(|s| Some((s.handler.clone(), s.negotiated?)))
    }

    fn run_publish(&self) {
        let Some((publish, format)) = self.streaming_handler(Direction::Publish) else {
            return;
        };
        let stride = format.stride.max(format.width * BYTES_PER_PIXEL as u32);
        let mut buffer = LoopbackBuffer {
            chunk: Some(ChunkMeta::default()),
            data: Some(vec![0; stride as usize * format.height as usize]),
        };
        publish.process(&mut buffer);

        let linked = !self.lock().unlinked;
        if linked {
            if let Some((capture, _)) = self.streaming_handler(Direction::Capture) {
                let mut delivered = buffer.clone();
                capture.process(&mut delivered);
            }
        }
        self.lock().last_publish = Some(buffer);
    }

    fn run_injected_captures(&self) {
        let queued: Vec<LoopbackBuffer> = self.lock().capture_queue.drain(..).collect();
        if queued.is_empty() {
            return;
        }
        let Some((capture, _)) = self.streaming_handler(Direction::Capture) else {
            trace!(dropped = queued.len(), "No capture stream, dropping injected buffers");
            return;
        };
        for mut buffer in queued {
            capture.process(&mut buffer);
        }
    }
}

/// Event loop guard of the simulated bus.
#[derive(Debug)]
pub struct LoopbackMainLoop {
    bus: LoopbackBus,
}

impl EventLoop for LoopbackMainLoop {
    fn iterate(&self) -> Result<()> {
        self.bus.iterate();
        Ok(())
    }
}

impl Drop for LoopbackMainLoop {
    fn drop(&mut self) {
        self.bus.release(Handle::MainLoop);
    }
}

/// Context guard of the simulated bus.
#[derive(Debug)]
pub struct LoopbackContext {
    bus: LoopbackBus,
}

impl Drop for LoopbackContext {
    fn drop(&mut self) {
        self.bus.release(Handle::Context);
    }
}

/// Core guard of the simulated bus.
#[derive(Debug)]
pub struct LoopbackCore {
    bus: LoopbackBus,
}

impl Drop for LoopbackCore {
    fn drop(&mut self) {
        self.bus.release(Handle::Core);
    }
}

/// Registry subscription guard of the simulated bus.
#[derive(Debug)]
pub struct LoopbackRegistry {
    bus: LoopbackBus,
    id: u64,
}

impl Drop for LoopbackRegistry {
    fn drop(&mut self) {
        self.bus.lock().registries.retain(|r| r.id != self.id);
        self.bus.release(Handle::Registry);
    }
}

/// Stream guard of the simulated bus.
#[derive(Debug)]
pub struct LoopbackStream {
    bus: LoopbackBus,
    id: u64,
    direction: Direction,
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        self.bus.lock().streams.retain(|s| s.id != self.id);
        self.bus.release(Handle::Stream(self.direction));
    }
}

impl Backend for LoopbackBus {
    type MainLoop = LoopbackMainLoop;
    type Context = LoopbackContext;
    type Core = LoopbackCore;
    type Registry = LoopbackRegistry;
    type Stream = LoopbackStream;

    fn create_main_loop(&self) -> Result<LoopbackMainLoop> {
        self.lock().acquire(Handle::MainLoop)?;
        Ok(LoopbackMainLoop { bus: self.clone() })
    }

    fn create_context(&self, _main_loop: &LoopbackMainLoop) -> Result<LoopbackContext> {
        self.lock().acquire(Handle::Context)?;
        Ok(LoopbackContext { bus: self.clone() })
    }

    fn connect_core(&self, _context: &LoopbackContext) -> Result<LoopbackCore> {
        self.lock().acquire(Handle::Core)?;
        Ok(LoopbackCore { bus: self.clone() })
    }

    fn get_registry(&self, _core: &LoopbackCore, handler: RegistryHandler) -> Result<LoopbackRegistry> {
        let mut state = self.lock();
        let id = state.acquire(Handle::Registry)?;
        let pending = state
            .globals
            .values()
            .cloned()
            .map(RegistryEvent::Added)
            .collect();
        state.registries.push(RegistryEntry {
            id,
            handler,
            pending,
        });
        Ok(LoopbackRegistry {
            bus: self.clone(),
            id,
        })
    }

    fn connect_stream(
        &self,
        _core: &LoopbackCore,
        request: StreamRequest,
        handler: StreamHandler,
    ) -> Result<LoopbackStream> {
        let mut state = self.lock();
        let direction = request.direction;
        state.requests.push(request.clone());
        let id = state.acquire(Handle::Stream(direction))?;
        state.streams.push(StreamEntry {
            id,
            direction,
            handler,
            proposal: request.proposal,
            negotiated: None,
            pending_format: None,
            state: StreamState::Connecting,
        });
        Ok(LoopbackStream {
            bus: self.clone(),
            id,
            direction,
        })
    }
}
