// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Ownership of the bus handles of one connection.

use tracing::{debug, info};

use crate::{
    Direction, Error, Result,
    backend::{Backend, EventLoop, StreamRequest},
    registry::RegistryHandler,
    stream::StreamController,
};

/// A live bus connection.
///
/// Handles are acquired in dependency order by [`Session::open`] and released
/// in the reverse order by [`Session::teardown`], which also runs on drop.
/// Every guard slot is individually optional so a partially opened session
/// unwinds exactly what it acquired, once.
pub(crate) struct Session<B: Backend> {
    streams: Vec<(Direction, B::Stream)>,
    registry: Option<B::Registry>,
    core: Option<B::Core>,
    context: Option<B::Context>,
    main_loop: Option<B::MainLoop>,
    controller: StreamController,
}

impl<B: Backend> Session<B> {
    fn empty(controller: StreamController) -> Self {
        Self {
            streams: Vec::new(),
            registry: None,
            core: None,
            context: None,
            main_loop: None,
            controller,
        }
    }

    /// Connects to the bus and opens one stream per enabled direction of
    /// `controller`.
    ///
    /// # Errors
    ///
    /// Returns the first acquisition failure; everything acquired up to that
    /// point has been released when this returns.
    pub(crate) fn open(
        backend: &B,
        registry_handler: RegistryHandler,
        controller: StreamController,
        mut request_for: impl FnMut(Direction) -> StreamRequest,
    ) -> Result<Self> {
        let mut session = Self::empty(controller);

        let main_loop = session.main_loop.insert(backend.create_main_loop()?);
        let context = session.context.insert(backend.create_context(main_loop)?);
        let core = session.core.insert(backend.connect_core(context)?);
        session.registry = Some(backend.get_registry(core, registry_handler)?);
        debug!("Bus connection established");

        let directions: Vec<Direction> = session.controller.directions().collect();
        for direction in directions {
            let Some(handler) = session.controller.handler(direction) else {
                continue;
            };
            let request = request_for(direction);
            request.check_strings()?;
            info!(
                %direction,
                name = %request.name,
                target = request.properties.get(crate::stream::keys::TARGET_OBJECT).map(String::as_str),
                "Connecting stream"
            );
            session.controller.mark_connecting(direction);
            let stream = backend
                .connect_stream(core, request, handler)
                .map_err(|e| match e {
                    e @ Error::StreamConnect { .. } => e,
                    other => Error::StreamConnect {
                        direction,
                        reason: other.to_string(),
                    },
                })?;
            session.streams.push((direction, stream));
        }

        Ok(session)
    }

    pub(crate) fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Runs one non-blocking iteration of the event loop.
    pub(crate) fn iterate(&self) -> Result<()> {
        match &self.main_loop {
            Some(main_loop) => main_loop.iterate(),
            None => Ok(()),
        }
    }

    /// Releases streams, registry, core, context and main loop, in that order.
    ///
    /// Calling it again is a no-op.
    pub(crate) fn teardown(&mut self) {
        while let Some((direction, stream)) = self.streams.pop() {
            debug!(%direction, "Destroying stream");
            drop(stream);
        }
        if self.registry.take().is_some() {
            debug!("Registry released");
        }
        if self.core.take().is_some() {
            debug!("Core disconnected");
        }
        if self.context.take().is_some() {
            debug!("Context destroyed");
        }
        if self.main_loop.take().is_some() {
            debug!("Main loop destroyed");
        }
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
