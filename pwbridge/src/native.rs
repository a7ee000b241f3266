// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! PipeWire client backend.
//!
//! Maps the [`Backend`] seam onto libpipewire through the `pipewire` crate.
//! All handles are thread-affine: a `Bridge<PipeWireBackend>` must stay on the
//! thread that set it up.

use std::{io::Cursor, time::Duration};

use pipewire as pw;
use pw::spa;
use spa::{
    param::{
        ParamType,
        format::{FormatProperties, MediaSubtype, MediaType},
        format_utils,
        video::{VideoFormat, VideoInfoRaw},
    },
    pod::{
        CanonicalFixedSizedPod, ChoiceValue, Object, Pod, Property, PropertyFlags, Value,
        serialize::PodSerializer,
    },
    utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes},
};
use tracing::{debug, trace, warn};

use crate::{
    Direction, Error, PixelFormat, Result,
    backend::{Backend, BusBuffer, ChunkMeta, EventLoop, StreamRequest},
    format::{self, AcceptedFormat, FormatProposal},
    registry::{GlobalObject, GlobalType, RegistryHandler},
    stream::{StreamHandler, StreamState},
};

fn video_format(format: PixelFormat) -> VideoFormat {
    match format {
        PixelFormat::Rgbx => VideoFormat::RGBx,
        PixelFormat::Rgba => VideoFormat::RGBA,
        PixelFormat::Bgrx => VideoFormat::BGRx,
        PixelFormat::Bgra => VideoFormat::BGRA,
    }
}

fn pixel_format(format: VideoFormat) -> Option<PixelFormat> {
    match format {
        VideoFormat::RGBx => Some(PixelFormat::Rgbx),
        VideoFormat::RGBA => Some(PixelFormat::Rgba),
        VideoFormat::BGRx => Some(PixelFormat::Bgrx),
        VideoFormat::BGRA => Some(PixelFormat::Bgra),
        _ => None,
    }
}

fn size_rect(size: format::Size) -> Rectangle {
    Rectangle {
        width: size.width,
        height: size.height,
    }
}

fn fraction(rate: format::Fraction) -> Fraction {
    Fraction {
        num: rate.num,
        denom: rate.denom,
    }
}

fn choice<T, U>(choice: &format::Choice<T>, map: impl Fn(&T) -> U) -> Choice<U>
where
    U: CanonicalFixedSizedPod,
{
    let choice = match choice {
        format::Choice::Enum {
            default,
            alternatives,
        } => ChoiceEnum::Enum {
            default: map(default),
            alternatives: alternatives.iter().map(&map).collect(),
        },
        format::Choice::Range { default, min, max } => ChoiceEnum::Range {
            default: map(default),
            min: map(min),
            max: map(max),
        },
    };
    Choice(ChoiceFlags::empty(), choice)
}

fn property(key: FormatProperties, value: Value) -> Property {
    Property {
        key: key.as_raw(),
        flags: PropertyFlags::empty(),
        value,
    }
}

/// Serializes `proposal` as an EnumFormat object pod.
fn enum_format_pod(proposal: &FormatProposal) -> Result<Vec<u8>> {
    let object = Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties: vec![
            property(
                FormatProperties::MediaType,
                Value::Id(Id(MediaType::Video.as_raw())),
            ),
            property(
                FormatProperties::MediaSubtype,
                Value::Id(Id(MediaSubtype::Raw.as_raw())),
            ),
            property(
                FormatProperties::VideoFormat,
                Value::Choice(ChoiceValue::Id(choice(&proposal.formats, |f| {
                    Id(video_format(*f).as_raw())
                }))),
            ),
            property(
                FormatProperties::VideoSize,
                Value::Choice(ChoiceValue::Rectangle(choice(&proposal.size, |s| {
                    size_rect(*s)
                }))),
            ),
            property(
                FormatProperties::VideoFramerate,
                Value::Choice(ChoiceValue::Fraction(choice(&proposal.framerate, |r| {
                    fraction(*r)
                }))),
            ),
        ],
    };
    let (cursor, _) = PodSerializer::serialize(Cursor::new(Vec::new()), &Value::Object(object))
        .map_err(|e| Error::Other(format!("Serializing format pod: {e:?}")))?;
    Ok(cursor.into_inner())
}

/// Parses a Format param into an [`AcceptedFormat`].
///
/// Returns `None` for non-video or non-raw formats and for pixel layouts
/// outside the four supported ones. The stride is left to the buffers.
fn parse_accepted(param: &Pod) -> Option<AcceptedFormat> {
    let (media_type, media_subtype) = format_utils::parse_format(param).ok()?;
    if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
        return None;
    }
    let mut info = VideoInfoRaw::new();
    info.parse(param).ok()?;
    let Some(format) = pixel_format(info.format()) else {
        warn!(format = ?info.format(), "Bus selected an unsupported pixel format");
        return None;
    };
    let size = info.size();
    let rate = info.framerate();
    Some(AcceptedFormat {
        format,
        width: size.width,
        height: size.height,
        framerate: format::Fraction::new(rate.num, rate.denom),
        stride: 0,
    })
}

fn stream_state(state: pw::stream::StreamState) -> StreamState {
    match state {
        pw::stream::StreamState::Error(message) => StreamState::Error(message),
        pw::stream::StreamState::Unconnected => StreamState::Unconnected,
        pw::stream::StreamState::Connecting => StreamState::Connecting,
        pw::stream::StreamState::Paused => StreamState::Paused,
        pw::stream::StreamState::Streaming => StreamState::Streaming,
    }
}

/// First data plane of a dequeued buffer.
struct NativeBuffer<'a> {
    data: &'a mut spa::buffer::Data,
}

impl BusBuffer for NativeBuffer<'_> {
    fn chunk(&self) -> Option<ChunkMeta> {
        let chunk = self.data.chunk();
        Some(ChunkMeta {
            offset: chunk.offset(),
            size: chunk.size(),
            stride: chunk.stride(),
        })
    }

    fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.data()
    }

    fn set_chunk(&mut self, meta: ChunkMeta) {
        let chunk = self.data.chunk_mut();
        *chunk.offset_mut() = meta.offset;
        *chunk.size_mut() = meta.size;
        *chunk.stride_mut() = meta.stride;
    }
}

/// Event loop guard.
pub struct NativeMainLoop {
    main_loop: pw::main_loop::MainLoop,
}

impl EventLoop for NativeMainLoop {
    fn iterate(&self) -> Result<()> {
        let result = self.main_loop.loop_().iterate(Duration::ZERO);
        if result < 0 {
            return Err(Error::Other(format!("Loop iteration returned {result}")));
        }
        Ok(())
    }
}

/// Context guard.
pub struct NativeContext {
    context: pw::context::Context,
}

/// Core connection guard.
pub struct NativeCore {
    core: pw::core::Core,
}

/// Registry subscription guard. The listener is dropped before the proxy.
pub struct NativeRegistry {
    _listener: pw::registry::Listener,
    _registry: pw::registry::Registry,
}

/// Stream guard. The listener is dropped before the stream is destroyed.
pub struct NativeStream {
    _listener: pw::stream::StreamListener<()>,
    _stream: pw::stream::Stream,
}

/// Backend talking to the PipeWire daemon of the current session.
#[derive(Debug)]
pub struct PipeWireBackend {
    _init: (),
}

impl Default for PipeWireBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeWireBackend {
    /// Initializes libpipewire. Repeated initialization is harmless.
    pub fn new() -> Self {
        pw::init();
        Self { _init: () }
    }
}

impl Backend for PipeWireBackend {
    type MainLoop = NativeMainLoop;
    type Context = NativeContext;
    type Core = NativeCore;
    type Registry = NativeRegistry;
    type Stream = NativeStream;

    fn create_main_loop(&self) -> Result<NativeMainLoop> {
        let main_loop = pw::main_loop::MainLoop::new(None)?;
        Ok(NativeMainLoop { main_loop })
    }

    fn create_context(&self, main_loop: &NativeMainLoop) -> Result<NativeContext> {
        let context = pw::context::Context::new(&main_loop.main_loop)
            .map_err(|e| Error::BusUnavailable(format!("Creating context: {e}")))?;
        Ok(NativeContext { context })
    }

    fn connect_core(&self, context: &NativeContext) -> Result<NativeCore> {
        let core = context
            .context
            .connect(None)
            .map_err(|e| Error::BusUnavailable(format!("Connecting to daemon: {e}")))?;
        debug!("Connected to PipeWire");
        Ok(NativeCore { core })
    }

    fn get_registry(&self, core: &NativeCore, handler: RegistryHandler) -> Result<NativeRegistry> {
        let registry = core
            .core
            .get_registry()
            .map_err(|e| Error::BusUnavailable(format!("Getting registry: {e}")))?;
        let on_remove = handler.clone();
        let listener = registry
            .add_listener_local()
            .global(move |global| {
                let object_type = match &global.type_ {
                    pw::types::ObjectType::Node => GlobalType::Node,
                    pw::types::ObjectType::Port => GlobalType::Port,
                    other => GlobalType::Other(format!("{other:?}")),
                };
                let props = global
                    .props
                    .map(|dict| {
                        dict.iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                handler.global_added(&GlobalObject {
                    id: global.id,
                    object_type,
                    props,
                });
            })
            .global_remove(move |id| on_remove.global_removed(id))
            .register();
        Ok(NativeRegistry {
            _listener: listener,
            _registry: registry,
        })
    }

    fn connect_stream(
        &self,
        core: &NativeCore,
        request: StreamRequest,
        handler: StreamHandler,
    ) -> Result<NativeStream> {
        let direction = request.direction;
        let connect_err = |reason: String| Error::StreamConnect { direction, reason };

        let mut properties = pw::properties::Properties::new();
        for (key, value) in &request.properties {
            properties.insert(key.as_str(), value.as_str());
        }
        let stream = pw::stream::Stream::new(&core.core, &request.name, properties)
            .map_err(|e| connect_err(format!("Creating stream: {e}")))?;

        let on_state = handler.clone();
        let on_param = handler.clone();
        let listener = stream
            .add_local_listener_with_user_data(())
            .state_changed(move |_, _, old, new| {
                on_state.state_changed(stream_state(old), stream_state(new));
            })
            .param_changed(move |_, _, id, param| {
                if id != ParamType::Format.as_raw() {
                    return;
                }
                let Some(param) = param else {
                    return;
                };
                match parse_accepted(param) {
                    Some(accepted) => on_param.format_changed(&accepted),
                    None => trace!("Ignoring format param"),
                }
            })
            .process(move |stream, _| {
                let Some(mut buffer) = stream.dequeue_buffer() else {
                    trace!("No buffer available");
                    return;
                };
                if let Some(data) = buffer.datas_mut().first_mut() {
                    handler.process(&mut NativeBuffer { data });
                }
            })
            .register()
            .map_err(|e| connect_err(format!("Registering listener: {e}")))?;

        let bytes = enum_format_pod(&request.proposal)?;
        let pod = Pod::from_bytes(&bytes)
            .ok_or_else(|| connect_err("Format pod is malformed".to_string()))?;
        let spa_direction = match direction {
            Direction::Publish => spa::utils::Direction::Output,
            Direction::Capture => spa::utils::Direction::Input,
        };
        stream
            .connect(
                spa_direction,
                None,
                pw::stream::StreamFlags::AUTOCONNECT | pw::stream::StreamFlags::MAP_BUFFERS,
                &mut [pod],
            )
            .map_err(|e| connect_err(format!("Connecting: {e}")))?;

        Ok(NativeStream {
            _listener: listener,
            _stream: stream,
        })
    }
}
