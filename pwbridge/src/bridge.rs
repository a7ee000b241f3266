// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! The application-facing bridge.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    Direction, Error, ErrorCategory, NegotiatedVideo, Pixels, PixelFormat, Result,
    backend::Backend,
    config::{BridgeConfig, DEFAULT_NAME, Target, VideoConfig},
    registry::{NodeInfo, PortInfo, RegistryCatalog, RegistryHandler},
    session::Session,
    stream::{self, StreamController, StreamIdentity, StreamState},
};

/// Arguments of the last successful setup, replayed by [`Bridge::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SetupArgs {
    publish: bool,
    capture: bool,
    config: VideoConfig,
}

/// Video bridge to the bus.
///
/// A bridge publishes frames submitted by the application as an output node
/// and/or captures frames from an input node, converting pixel formats in both
/// directions. It is driven by the application's tick:
///
/// 1. configure names, formats and targets, then call [`Bridge::setup`] once;
/// 2. call [`Bridge::update`] every tick to pump bus events;
/// 3. exchange pixels with [`Bridge::submit_frame`] and
///    [`Bridge::get_latest_frame`];
/// 4. call [`Bridge::shutdown`], or drop the bridge.
///
/// `update`, the frame operations and the catalog queries take `&self`, so
/// with a thread-safe backend the pump and the application may run on
/// different threads.
///
/// # Examples
///
/// ```
/// use pwbridge::{Bridge, LoopbackBus, Pixels, VideoConfig};
///
/// let mut bridge = Bridge::new(LoopbackBus::new());
/// assert!(bridge.setup(true, true, VideoConfig::new(640, 360, 30)));
///
/// let mut red = Pixels::allocate(640, 360, 4);
/// red.fill(&[255, 0, 0, 255]);
/// assert!(bridge.submit_frame(&red));
/// bridge.update();
///
/// let mut out = Pixels::new();
/// assert!(bridge.get_latest_frame(&mut out));
/// assert_eq!(out.pixel(0, 0), Some(&[255, 0, 0, 255][..]));
/// ```
pub struct Bridge<B: Backend> {
    session: Option<Session<B>>,
    catalog: Arc<RegistryCatalog>,
    backend: B,
    app_name: String,
    node_name: String,
    preferred_formats: Vec<PixelFormat>,
    publish_target: Target,
    capture_target: Target,
    last_setup: Option<SetupArgs>,
}

impl<B: Backend> Bridge<B> {
    /// Creates an uninitialized bridge on top of `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            session: None,
            catalog: Arc::new(RegistryCatalog::new()),
            backend,
            app_name: DEFAULT_NAME.to_string(),
            node_name: DEFAULT_NAME.to_string(),
            preferred_formats: PixelFormat::DEFAULT_PREFERENCE.to_vec(),
            publish_target: Target::default(),
            capture_target: Target::default(),
            last_setup: None,
        }
    }

    /// Sets the `application.name` used for streams opened by later setups.
    pub fn set_app_name(&mut self, name: impl Into<String>) {
        self.app_name = name.into();
    }

    /// Sets the `node.name` used for streams opened by later setups.
    pub fn set_node_name(&mut self, name: impl Into<String>) {
        self.node_name = name.into();
    }

    /// Sets the pixel formats offered to the bus, in preference order.
    ///
    /// An empty list is ignored.
    pub fn set_preferred_video_formats(&mut self, formats: &[PixelFormat]) {
        if formats.is_empty() {
            warn!("Ignoring empty preferred format list");
            return;
        }
        self.preferred_formats = formats.to_vec();
    }

    /// Pixel formats offered to the bus.
    pub fn preferred_video_formats(&self) -> &[PixelFormat] {
        &self.preferred_formats
    }

    /// Targets the publish stream at a node name. Takes effect at the next setup.
    pub fn set_publish_target_node_name(&mut self, name: impl Into<String>) {
        self.publish_target.node_name = Some(name.into());
    }

    /// Targets the publish stream at an object serial. Takes effect at the next setup.
    pub fn set_publish_target_object_serial(&mut self, serial: impl Into<String>) {
        self.publish_target.object_serial = Some(serial.into());
    }

    /// Targets the capture stream at a node name. Takes effect at the next setup.
    pub fn set_capture_target_node_name(&mut self, name: impl Into<String>) {
        self.capture_target.node_name = Some(name.into());
    }

    /// Targets the capture stream at an object serial. Takes effect at the next setup.
    pub fn set_capture_target_object_serial(&mut self, serial: impl Into<String>) {
        self.capture_target.object_serial = Some(serial.into());
    }

    /// Applies the naming, format and target settings of `config`.
    ///
    /// The enable flags and video parameters are only used by
    /// [`Self::setup_from_config`].
    pub fn configure(&mut self, config: &BridgeConfig) {
        self.set_app_name(config.app_name.clone());
        self.set_node_name(config.node_name.clone());
        self.set_preferred_video_formats(&config.preferred_formats);
        self.publish_target = config.publish_target.clone();
        self.capture_target = config.capture_target.clone();
    }

    /// Applies `config` and sets the bridge up with its enable flags and video parameters.
    pub fn setup_from_config(&mut self, config: &BridgeConfig) -> bool {
        self.configure(config);
        self.setup(config.publish, config.capture, config.video)
    }

    /// Snapshot of all discovered nodes.
    pub fn get_nodes(&self) -> Vec<NodeInfo> {
        self.catalog.nodes()
    }

    /// Snapshot of the discovered nodes whose media class contains `Video`.
    pub fn get_video_nodes(&self) -> Vec<NodeInfo> {
        self.catalog.video_nodes()
    }

    /// Snapshot of all discovered ports.
    pub fn get_ports(&self) -> Vec<PortInfo> {
        self.catalog.ports()
    }

    /// The registry catalog, for lookups beyond the snapshot queries.
    pub fn catalog(&self) -> &RegistryCatalog {
        &self.catalog
    }

    /// Connects to the bus and opens the requested streams.
    ///
    /// Returns `true` without side effects if the bridge is already initialized.
    ///
    /// # Errors
    ///
    /// * [`Error::NoStreamsRequested`] if neither direction is enabled.
    /// * [`Error::InvalidConfig`] if `config` is out of bounds.
    /// * [`Error::BusUnavailable`] if the bus connection cannot be established.
    /// * [`Error::StreamConnect`] if a stream fails to connect.
    ///
    /// On error nothing stays acquired and the bridge is not initialized.
    pub fn try_setup(&mut self, publish: bool, capture: bool, config: VideoConfig) -> Result<()> {
        if self.session.is_some() {
            debug!("Setup called on an initialized bridge");
            return Ok(());
        }
        if !publish && !capture {
            return Err(Error::NoStreamsRequested);
        }
        config.validate()?;

        let controller = StreamController::new(publish, capture, &config, &self.preferred_formats);
        let session = Session::open(
            &self.backend,
            RegistryHandler::new(Arc::clone(&self.catalog)),
            controller,
            |direction| {
                let target = match direction {
                    Direction::Publish => &self.publish_target,
                    Direction::Capture => &self.capture_target,
                };
                stream::stream_request(
                    direction,
                    StreamIdentity {
                        app_name: &self.app_name,
                        node_name: &self.node_name,
                        target,
                    },
                    &self.preferred_formats,
                    &config,
                )
            },
        )?;

        info!(
            publish,
            capture,
            width = config.width,
            height = config.height,
            fps = config.fps,
            node = %self.node_name,
            "Bridge initialized"
        );
        self.session = Some(session);
        self.last_setup = Some(SetupArgs {
            publish,
            capture,
            config,
        });
        Ok(())
    }

    /// Boolean form of [`Self::try_setup`]; failures are logged.
    pub fn setup(&mut self, publish: bool, capture: bool, config: VideoConfig) -> bool {
        match self.try_setup(publish, capture, config) {
            Ok(()) => true,
            Err(e) => {
                error!(category = ?e.category(), "Setup failed: {e}");
                false
            }
        }
    }

    /// Pumps one non-blocking iteration of the bus event loop.
    ///
    /// Registry and stream notifications are only delivered from here.
    pub fn update(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = session.iterate() {
            warn!("Event loop iteration failed: {e}");
        }
    }

    /// Closes all streams and the bus connection. Safe to call repeatedly.
    ///
    /// The registry catalog is emptied since its ids are only meaningful
    /// while connected.
    pub fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.teardown();
        self.catalog.clear();
        info!("Bridge shut down");
    }

    /// Shuts down and sets up again with the arguments of the last successful
    /// setup, picking up changed names, formats and targets.
    ///
    /// Blocks for the whole teardown and reconnect. Returns `false` if the
    /// bridge was never set up or the new setup fails.
    pub fn reconnect(&mut self) -> bool {
        let Some(args) = self.last_setup else {
            warn!("Reconnect requested before any successful setup");
            return false;
        };
        info!("Reconnecting");
        self.shutdown();
        self.setup(args.publish, args.capture, args.config)
    }

    /// Returns `true` between a successful setup and shutdown.
    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Stores `pixels` as the next frame of the publish stream.
    ///
    /// 3-channel input is promoted to RGBA; input of another size is resampled
    /// to the negotiated size.
    ///
    /// # Errors
    ///
    /// * [`Error::NotInitialized`] before setup.
    /// * [`Error::DirectionDisabled`] if publishing was not enabled.
    /// * [`Error::Unallocated`] or [`Error::UnsupportedChannels`] for unusable input.
    pub fn try_submit_frame(&self, pixels: &Pixels) -> Result<()> {
        self.session
            .as_ref()
            .ok_or(Error::NotInitialized)?
            .controller()
            .submit_frame(pixels)
    }

    /// Boolean form of [`Self::try_submit_frame`].
    pub fn submit_frame(&self, pixels: &Pixels) -> bool {
        match self.try_submit_frame(pixels) {
            Ok(()) => true,
            Err(e) if e.category() == ErrorCategory::FormatMismatch => {
                warn!("Frame rejected: {e}");
                false
            }
            Err(e) => {
                debug!("Frame not submitted: {e}");
                false
            }
        }
    }

    /// Copies the most recent captured frame into `out` as RGBA.
    ///
    /// Returns `Ok(false)` while no frame has arrived. The frame is not
    /// consumed.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before setup, [`Error::DirectionDisabled`] if
    /// capturing was not enabled.
    pub fn try_get_latest_frame(&self, out: &mut Pixels) -> Result<bool> {
        self.session
            .as_ref()
            .ok_or(Error::NotInitialized)?
            .controller()
            .latest_frame(out)
    }

    /// Boolean form of [`Self::try_get_latest_frame`].
    pub fn get_latest_frame(&self, out: &mut Pixels) -> bool {
        self.try_get_latest_frame(out).unwrap_or(false)
    }

    /// Current negotiated format of `direction`, `None` if not open.
    pub fn negotiated_format(&self, direction: Direction) -> Option<NegotiatedVideo> {
        self.session
            .as_ref()
            .and_then(|session| session.controller().negotiated(direction))
    }

    /// Last reported state of the `direction` stream, `None` if not open.
    pub fn stream_state(&self, direction: Direction) -> Option<StreamState> {
        self.session
            .as_ref()
            .and_then(|session| session.controller().state(direction))
    }
}

impl<B: Backend> Drop for Bridge<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
