// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Stream controller.
//!
//! The controller owns up to two stream sides, one per direction. Each side
//! carries the direction's negotiated format, its frame slot and the last
//! reported stream state. Bus-side callbacks reach a side through a
//! [`PublishHandler`] or [`CaptureHandler`]; the application reaches it
//! through [`crate::Bridge::submit_frame`] and
//! [`crate::Bridge::get_latest_frame`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    Direction, Error, Pixels, PixelFormat, Result,
    backend::{BusBuffer, ChunkMeta, StreamRequest},
    config::{Target, VideoConfig},
    convert::{self, BYTES_PER_PIXEL},
    format::{self, AcceptedFormat, NegotiatedVideo},
    mailbox::FrameSlot,
};

/// Stream connection property keys.
pub mod keys {
    /// Media type of the stream.
    pub const MEDIA_TYPE: &str = "media.type";
    /// `Capture` for producers, `Playback` for consumers.
    pub const MEDIA_CATEGORY: &str = "media.category";
    /// Intended use of the stream.
    pub const MEDIA_ROLE: &str = "media.role";
    /// Name of the application owning the stream.
    pub const APP_NAME: &str = "application.name";
    /// Node name of the stream.
    pub const NODE_NAME: &str = "node.name";
    /// Object the session manager should link the stream to.
    pub const TARGET_OBJECT: &str = "target.object";
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not connected.
    #[default]
    Unconnected,
    /// Connecting to the bus.
    Connecting,
    /// Connected, not moving buffers.
    Paused,
    /// Moving buffers.
    Streaming,
    /// Failed; carries the bus's message.
    Error(String),
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Unconnected => f.write_str("unconnected"),
            StreamState::Connecting => f.write_str("connecting"),
            StreamState::Paused => f.write_str("paused"),
            StreamState::Streaming => f.write_str("streaming"),
            StreamState::Error(message) => write!(f, "error ({message})"),
        }
    }
}

/// Names and target used to build a [`StreamRequest`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamIdentity<'a> {
    pub app_name: &'a str,
    pub node_name: &'a str,
    pub target: &'a Target,
}

/// Builds the connection request for `direction`.
pub(crate) fn stream_request(
    direction: Direction,
    identity: StreamIdentity<'_>,
    preferred: &[PixelFormat],
    config: &VideoConfig,
) -> StreamRequest {
    let (suffix, category) = match direction {
        Direction::Publish => ("Publish", "Capture"),
        Direction::Capture => ("Capture", "Playback"),
    };
    let mut properties = BTreeMap::from([
        (keys::MEDIA_TYPE.to_string(), "Video".to_string()),
        (keys::MEDIA_CATEGORY.to_string(), category.to_string()),
        (keys::MEDIA_ROLE.to_string(), "Screen".to_string()),
        (keys::APP_NAME.to_string(), identity.app_name.to_string()),
        (keys::NODE_NAME.to_string(), identity.node_name.to_string()),
    ]);
    if let Some(target) = identity.target.property_value() {
        properties.insert(keys::TARGET_OBJECT.to_string(), target.to_string());
    }
    StreamRequest {
        name: format!("{} {}", identity.node_name, suffix),
        direction,
        properties,
        proposal: format::propose(preferred, config),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the application and the bus callbacks for one direction.
#[derive(Debug)]
pub(crate) struct StreamSide {
    direction: Direction,
    video: Mutex<NegotiatedVideo>,
    slot: FrameSlot,
    state: Mutex<StreamState>,
}

impl StreamSide {
    fn new(direction: Direction, provisional: NegotiatedVideo) -> Self {
        Self {
            direction,
            video: Mutex::new(provisional),
            slot: FrameSlot::new(),
            state: Mutex::new(StreamState::Unconnected),
        }
    }

    /// Snapshot of the negotiated format.
    pub(crate) fn video(&self) -> NegotiatedVideo {
        *lock(&self.video)
    }

    pub(crate) fn state(&self) -> StreamState {
        lock(&self.state).clone()
    }

    fn format_changed(&self, accepted: &AcceptedFormat) {
        let video = NegotiatedVideo::accept(accepted);
        info!(
            direction = %self.direction,
            format = %video.format,
            width = video.width,
            height = video.height,
            fps = video.frame_rate,
            stride = video.stride,
            "Format negotiated"
        );
        *lock(&self.video) = video;
    }

    fn state_changed(&self, old: &StreamState, new: StreamState) {
        match &new {
            StreamState::Error(message) => {
                error!(direction = %self.direction, "Stream error: {message}")
            }
            StreamState::Streaming => info!(direction = %self.direction, "Stream is streaming"),
            _ => trace!(direction = %self.direction, %old, %new, "Stream state changed"),
        }
        *lock(&self.state) = new;
    }
}

/// Publish-side notification handler.
#[derive(Debug, Clone)]
pub struct PublishHandler {
    side: Arc<StreamSide>,
}

impl PublishHandler {
    /// Fills a buffer requested by the bus with the latest submitted frame.
    ///
    /// A frame stored before a size renegotiation is resampled to the new
    /// size once. Without a frame the visible area is zero-filled. Buffers
    /// without a chunk or mapping, or too small for one frame, are left
    /// untouched.
    fn process(&self, buffer: &mut dyn BusBuffer) {
        let video = self.side.video();
        if buffer.chunk().is_none() {
            trace!("Publish buffer without chunk ignored");
            return;
        }
        let stride = video.stride as usize;
        let frame_bytes = video.frame_bytes();
        {
            let Some(data) = buffer.data_mut() else {
                trace!("Unmapped publish buffer ignored");
                return;
            };
            if data.len() < frame_bytes {
                warn!(
                    available = data.len(),
                    required = frame_bytes,
                    "Publish buffer too small, ignoring"
                );
                return;
            }

            let mut frame = self.side.slot.lock();
            if frame.has_data && (frame.width != video.width || frame.height != video.height) {
                debug!(
                    from_width = frame.width,
                    from_height = frame.height,
                    to_width = video.width,
                    to_height = video.height,
                    "Resampling stored frame to renegotiated size"
                );
                let mut resized =
                    vec![0; video.width as usize * video.height as usize * BYTES_PER_PIXEL];
                convert::resample_into(
                    &frame.data,
                    (frame.width, frame.height),
                    &mut resized,
                    (video.width, video.height),
                    BYTES_PER_PIXEL,
                );
                frame.width = video.width;
                frame.height = video.height;
                frame.data = resized;
            }
            if frame.has_data {
                let row_bytes = frame.row_bytes();
                let from = frame.format;
                convert::for_each_row(
                    &frame.data,
                    row_bytes,
                    data,
                    stride,
                    row_bytes,
                    video.height as usize,
                    |src, dst| convert::repack(src, dst, from, video.format),
                );
            } else {
                data[..frame_bytes].fill(0);
            }
        }
        buffer.set_chunk(ChunkMeta {
            offset: 0,
            size: frame_bytes as u32,
            stride: video.stride as i32,
        });
    }
}

/// Capture-side notification handler.
#[derive(Debug, Clone)]
pub struct CaptureHandler {
    side: Arc<StreamSide>,
}

impl CaptureHandler {
    /// Converts a buffer delivered by the bus into the capture slot.
    fn process(&self, buffer: &mut dyn BusBuffer) {
        let video = self.side.video();
        let Some(chunk) = buffer.chunk() else {
            trace!("Capture buffer without chunk ignored");
            return;
        };
        let Some(data) = buffer.data_mut() else {
            trace!("Unmapped capture buffer ignored");
            return;
        };

        let row_bytes = video.row_bytes();
        let rows = video.height as usize;
        let stride = if chunk.stride > 0 {
            chunk.stride as usize
        } else {
            video.width as usize * BYTES_PER_PIXEL
        };
        let required = match rows {
            0 => 0,
            _ => stride * (rows - 1) + row_bytes,
        };
        let offset = chunk.offset as usize;
        let source = match data.get(offset..) {
            Some(source) if stride >= row_bytes && source.len() >= required => source,
            _ => {
                warn!(
                    offset,
                    stride,
                    available = data.len(),
                    required,
                    "Malformed capture buffer, ignoring"
                );
                return;
            }
        };

        let mut frame = self.side.slot.lock();
        if frame.ensure(video.width, video.height, PixelFormat::Rgba) {
            info!(width = video.width, height = video.height, "Capture buffer reallocated");
        }
        convert::for_each_row(
            source,
            stride,
            &mut frame.data,
            row_bytes,
            row_bytes,
            rows,
            |src, dst| convert::packed_to_rgba(src, dst, video.format),
        );
        frame.has_data = true;
        trace!(width = video.width, height = video.height, "Captured frame");
    }
}

/// Notification handler registered with one stream.
///
/// Dispatches to the side it was created for.
#[derive(Debug, Clone)]
pub enum StreamHandler {
    /// Handler of the publish stream.
    Publish(PublishHandler),
    /// Handler of the capture stream.
    Capture(CaptureHandler),
}

impl StreamHandler {
    fn side(&self) -> &StreamSide {
        match self {
            StreamHandler::Publish(handler) => &handler.side,
            StreamHandler::Capture(handler) => &handler.side,
        }
    }

    /// Direction of the stream this handler serves.
    pub fn direction(&self) -> Direction {
        self.side().direction
    }

    /// "Format changed" notification: the bus selected `accepted`.
    pub fn format_changed(&self, accepted: &AcceptedFormat) {
        self.side().format_changed(accepted);
    }

    /// "Process" notification: a buffer is ready to be filled or drained.
    pub fn process(&self, buffer: &mut dyn BusBuffer) {
        match self {
            StreamHandler::Publish(handler) => handler.process(buffer),
            StreamHandler::Capture(handler) => handler.process(buffer),
        }
    }

    /// "State changed" notification.
    pub fn state_changed(&self, old: StreamState, new: StreamState) {
        self.side().state_changed(&old, new);
    }
}

/// Owns the enabled stream sides of a session.
#[derive(Debug)]
pub(crate) struct StreamController {
    publish: Option<Arc<StreamSide>>,
    capture: Option<Arc<StreamSide>>,
}

impl StreamController {
    pub(crate) fn new(
        publish: bool,
        capture: bool,
        config: &VideoConfig,
        preferred: &[PixelFormat],
    ) -> Self {
        let provisional = NegotiatedVideo::provisional(config, preferred);
        Self {
            publish: publish.then(|| Arc::new(StreamSide::new(Direction::Publish, provisional))),
            capture: capture.then(|| Arc::new(StreamSide::new(Direction::Capture, provisional))),
        }
    }

    fn side(&self, direction: Direction) -> Option<&Arc<StreamSide>> {
        match direction {
            Direction::Publish => self.publish.as_ref(),
            Direction::Capture => self.capture.as_ref(),
        }
    }

    /// Directions enabled in this controller, publish first.
    pub(crate) fn directions(&self) -> impl Iterator<Item = Direction> + '_ {
        [Direction::Publish, Direction::Capture]
            .into_iter()
            .filter(|d| self.side(*d).is_some())
    }

    /// Creates the handler for `direction`, `None` if it is disabled.
    pub(crate) fn handler(&self, direction: Direction) -> Option<StreamHandler> {
        let side = Arc::clone(self.side(direction)?);
        Some(match direction {
            Direction::Publish => StreamHandler::Publish(PublishHandler { side }),
            Direction::Capture => StreamHandler::Capture(CaptureHandler { side }),
        })
    }

    pub(crate) fn negotiated(&self, direction: Direction) -> Option<NegotiatedVideo> {
        self.side(direction).map(|side| side.video())
    }

    pub(crate) fn state(&self, direction: Direction) -> Option<StreamState> {
        self.side(direction).map(|side| side.state())
    }

    /// Marks `direction` as connecting, ahead of the backend's own notifications.
    pub(crate) fn mark_connecting(&self, direction: Direction) {
        if let Some(side) = self.side(direction) {
            *lock(&side.state) = StreamState::Connecting;
        }
    }

    /// Converts `pixels` into the publish slot in the negotiated layout.
    ///
    /// # Errors
    ///
    /// [`Error::DirectionDisabled`] without a publish side, and the errors of
    /// [`convert::normalize_rgba`] for unusable input.
    pub(crate) fn submit_frame(&self, pixels: &Pixels) -> Result<()> {
        let side = self
            .publish
            .as_ref()
            .ok_or(Error::DirectionDisabled(Direction::Publish))?;
        let video = side.video();
        if pixels.width() != video.width || pixels.height() != video.height {
            trace!(
                from_width = pixels.width(),
                from_height = pixels.height(),
                to_width = video.width,
                to_height = video.height,
                "Resampling submitted frame"
            );
        }
        let rgba = convert::normalize_rgba(pixels, video.width, video.height)?;

        let mut frame = side.slot.lock();
        if frame.ensure(video.width, video.height, video.format) {
            info!(width = video.width, height = video.height, "Publish buffer reallocated");
        }
        convert::rgba_to_packed(rgba.data(), &mut frame.data, video.format);
        frame.has_data = true;
        Ok(())
    }

    /// Copies the latest captured frame into `out`.
    ///
    /// Returns `Ok(false)` while no frame has arrived.
    ///
    /// # Errors
    ///
    /// [`Error::DirectionDisabled`] without a capture side.
    pub(crate) fn latest_frame(&self, out: &mut Pixels) -> Result<bool> {
        let side = self
            .capture
            .as_ref()
            .ok_or(Error::DirectionDisabled(Direction::Capture))?;
        Ok(side.slot.copy_out(out))
    }

    /// Raw copy of the publish slot, for inspection in tests.
    #[cfg(test)]
    fn publish_frame(&self) -> Option<crate::mailbox::Frame> {
        self.publish.as_ref().map(|side| side.slot.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Fraction;

    struct TestBuffer {
        chunk: Option<ChunkMeta>,
        data: Option<Vec<u8>>,
    }

    impl BusBuffer for TestBuffer {
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

    fn controller(format: PixelFormat) -> StreamController {
        StreamController::new(true, true, &VideoConfig::new(4, 2, 30), &[format])
    }

    #[test]
    fn rgb_input_is_promoted_to_opaque() {
        let ctl = controller(PixelFormat::Rgba);
        let rgb = Pixels::from_raw(4, 2, 3, (0..24).collect()).unwrap();
        ctl.submit_frame(&rgb).unwrap();
        let frame = ctl.publish_frame().unwrap();
        assert!(frame.has_data);
        for (px, src) in frame.data.chunks_exact(4).zip(rgb.data().chunks_exact(3)) {
            assert_eq!(&px[..3], src);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn submit_stores_negotiated_layout() {
        let ctl = controller(PixelFormat::Bgrx);
        let mut red = Pixels::allocate(4, 2, 4);
        red.fill(&[255, 0, 0, 10]);
        ctl.submit_frame(&red).unwrap();
        let frame = ctl.publish_frame().unwrap();
        assert_eq!(&frame.data[..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn publish_without_frame_zero_fills() {
        let ctl = controller(PixelFormat::Rgbx);
        let handler = ctl.handler(Direction::Publish).unwrap();
        let mut buffer = TestBuffer {
            chunk: Some(ChunkMeta::default()),
            data: Some(vec![7; 64]),
        };
        handler.process(&mut buffer);
        let data = buffer.data.unwrap();
        assert!(data[..32].iter().all(|&b| b == 0));
        assert_eq!(
            buffer.chunk,
            Some(ChunkMeta {
                offset: 0,
                size: 32,
                stride: 16
            })
        );
    }

    #[test]
    fn publish_leaves_unusable_buffers_untouched() {
        let ctl = controller(PixelFormat::Rgbx);
        let mut img = Pixels::allocate(4, 2, 4);
        img.fill(&[1, 2, 3, 4]);
        ctl.submit_frame(&img).unwrap();
        let handler = ctl.handler(Direction::Publish).unwrap();
        let untouched_chunk = ChunkMeta {
            offset: 3,
            size: 5,
            stride: 7,
        };

        let mut no_chunk = TestBuffer {
            chunk: None,
            data: Some(vec![7; 64]),
        };
        handler.process(&mut no_chunk);
        assert_eq!(no_chunk.chunk, None);
        assert_eq!(no_chunk.data.unwrap(), vec![7; 64]);

        let mut unmapped = TestBuffer {
            chunk: Some(untouched_chunk),
            data: None,
        };
        handler.process(&mut unmapped);
        assert_eq!(unmapped.chunk, Some(untouched_chunk));

        // one byte short of 2 rows at 16 bytes
        let mut short = TestBuffer {
            chunk: Some(untouched_chunk),
            data: Some(vec![7; 31]),
        };
        handler.process(&mut short);
        assert_eq!(short.chunk, Some(untouched_chunk));
        assert_eq!(short.data.unwrap(), vec![7; 31]);
    }

    #[test]
    fn stored_frame_is_resampled_after_size_change() {
        let ctl = controller(PixelFormat::Rgba);
        let mut img = Pixels::allocate(4, 2, 4);
        img.fill(&[10, 20, 30, 40]);
        ctl.submit_frame(&img).unwrap();
        let handler = ctl.handler(Direction::Publish).unwrap();
        handler.format_changed(&AcceptedFormat {
            format: PixelFormat::Rgba,
            width: 8,
            height: 4,
            framerate: Fraction::new(30, 1),
            stride: 0,
        });
        let mut buffer = TestBuffer {
            chunk: Some(ChunkMeta::default()),
            data: Some(vec![0; 128]),
        };
        handler.process(&mut buffer);
        let data = buffer.data.unwrap();
        assert!(data.chunks_exact(4).all(|px| px == [10u8, 20, 30, 40]));
        assert_eq!(buffer.chunk.unwrap().size, 128);
        let frame = ctl.publish_frame().unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
    }

    #[test]
    fn publish_honors_padded_stride() {
        let ctl = controller(PixelFormat::Rgba);
        let handler = ctl.handler(Direction::Publish).unwrap();
        handler.format_changed(&AcceptedFormat {
            format: PixelFormat::Rgba,
            width: 4,
            height: 2,
            framerate: Fraction::new(30, 1),
            stride: 24,
        });
        let mut img = Pixels::allocate(4, 2, 4);
        img.fill(&[1, 2, 3, 4]);
        ctl.submit_frame(&img).unwrap();
        let mut buffer = TestBuffer {
            chunk: Some(ChunkMeta::default()),
            data: Some(vec![9; 48]),
        };
        handler.process(&mut buffer);
        let data = buffer.data.unwrap();
        assert_eq!(&data[..16], &[1u8, 2, 3, 4].repeat(4)[..]);
        assert_eq!(&data[16..24], &[9; 8]);
        assert_eq!(&data[24..40], &[1u8, 2, 3, 4].repeat(4)[..]);
        assert_eq!(buffer.chunk.unwrap().size, 48);
    }

    #[test]
    fn renegotiated_format_repacks_stored_frame() {
        let ctl = controller(PixelFormat::Rgba);
        let mut img = Pixels::allocate(4, 2, 4);
        img.fill(&[10, 20, 30, 40]);
        ctl.submit_frame(&img).unwrap();
        let handler = ctl.handler(Direction::Publish).unwrap();
        handler.format_changed(&AcceptedFormat {
            format: PixelFormat::Bgra,
            width: 4,
            height: 2,
            framerate: Fraction::new(30, 1),
            stride: 0,
        });
        let mut buffer = TestBuffer {
            chunk: Some(ChunkMeta::default()),
            data: Some(vec![0; 32]),
        };
        handler.process(&mut buffer);
        assert_eq!(&buffer.data.unwrap()[..4], &[30, 20, 10, 40]);
    }

    #[test]
    fn capture_ignores_malformed_buffers() {
        let ctl = controller(PixelFormat::Rgbx);
        let handler = ctl.handler(Direction::Capture).unwrap();
        let mut out = Pixels::new();

        handler.process(&mut TestBuffer {
            chunk: None,
            data: Some(vec![1; 32]),
        });
        handler.process(&mut TestBuffer {
            chunk: Some(ChunkMeta::default()),
            data: None,
        });
        handler.process(&mut TestBuffer {
            chunk: Some(ChunkMeta {
                offset: 16,
                size: 32,
                stride: 16,
            }),
            data: Some(vec![1; 32]),
        });
        assert!(!ctl.latest_frame(&mut out).unwrap());
    }

    #[test]
    fn capture_converts_with_offset_and_default_stride() {
        let ctl = controller(PixelFormat::Bgrx);
        let handler = ctl.handler(Direction::Capture).unwrap();
        let mut data = vec![0xAA; 8];
        data.extend([3u8, 2, 1, 0].repeat(8));
        handler.process(&mut TestBuffer {
            chunk: Some(ChunkMeta {
                offset: 8,
                size: 32,
                stride: 0,
            }),
            data: Some(data),
        });
        let mut out = Pixels::new();
        assert!(ctl.latest_frame(&mut out).unwrap());
        assert_eq!((out.width(), out.height(), out.channels()), (4, 2, 4));
        assert!(out.data().chunks_exact(4).all(|px| px == [1u8, 2, 3, 255]));
    }

    #[test]
    fn disabled_directions_are_reported() {
        let ctl = StreamController::new(false, true, &VideoConfig::default(), &[]);
        assert!(matches!(
            ctl.submit_frame(&Pixels::allocate(1, 1, 4)),
            Err(Error::DirectionDisabled(Direction::Publish))
        ));
        assert!(ctl.handler(Direction::Publish).is_none());
        assert_eq!(ctl.directions().collect::<Vec<_>>(), [Direction::Capture]);
    }

    #[test]
    fn request_carries_identity_and_target() {
        let target = Target {
            node_name: Some("cam".into()),
            object_serial: None,
        };
        let request = stream_request(
            Direction::Capture,
            StreamIdentity {
                app_name: "app",
                node_name: "node",
                target: &target,
            },
            &[],
            &VideoConfig::default(),
        );
        assert_eq!(request.name, "node Capture");
        assert_eq!(request.properties[keys::MEDIA_CATEGORY], "Playback");
        assert_eq!(request.properties[keys::TARGET_OBJECT], "cam");
        assert_eq!(request.properties[keys::APP_NAME], "app");
    }
}
