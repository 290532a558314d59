// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The video decoder element and its building blocks.
//!
//! A [`element::DucatiVidDec`] receives compressed access units, negotiates the output geometry
//! with the [`Downstream`] side, and drives a [`session::CodecSession`] through the engine's
//! process call. Output buffers come from downstream and are lent to the codec through the
//! [`bridge::BufferBridge`], which maps the codec's numeric identifiers back to them.

pub mod bridge;
pub mod element;
pub mod geometry;
pub mod session;

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use thiserror::Error;

use crate::decoder::session::SessionState;
use crate::engine::DEFAULT_ENGINE_NAME;
use crate::memory::AllocationError;
use crate::memory::BufferMemory;
use crate::memory::MemoryKind;
use crate::memory::PhysAddr;
use crate::memory::VirtAddr;
use crate::DecodedFormat;
use crate::Fraction;

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure affects the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Out of memory. Fatal to the current operation, which may succeed once downstream releases
    /// buffers.
    ResourceExhaustion,
    /// The hardware session is broken. Fatal to the stream.
    Session,
    /// Bad negotiation or incompatible buffers. Fatal to the current frame or negotiation.
    Configuration,
    /// A feature that is not implemented was needed.
    Unimplemented,
    /// Downstream flow control.
    Flow,
}

/// Features the decoder does not implement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Unimplemented {
    #[error("flushing the codec")]
    Flush,
    #[error("submitting more than one access unit per process call")]
    MultipleAccessUnits,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plane {
    Luma,
    Chroma,
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Plane::Luma => write!(f, "luma"),
            Plane::Chroma => write!(f, "chroma"),
        }
    }
}

/// Why an output buffer cannot be handed to the codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnsupportedReason {
    #[error("{plane} plane at {addr:?} has no physical address")]
    NotMapped { plane: Plane, addr: VirtAddr },
    #[error("{plane} plane at {addr} is outside of every known memory region")]
    UnknownRegion { plane: Plane, addr: PhysAddr },
    #[error("{plane} plane is {found:?} memory but the codec was given {expected:?} memory")]
    KindMismatch {
        plane: Plane,
        expected: MemoryKind,
        found: MemoryKind,
    },
    #[error("buffer holds {len} bytes, {needed} are needed")]
    TooSmall { len: usize, needed: u32 },
    #[error("buffer at {0} is already lent to the codec")]
    AlreadyRegistered(PhysAddr),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("stream format not negotiated yet")]
    NotNegotiated,
    #[error("downstream refused {0}")]
    Refused(String),
}

/// Flow-control results of downstream operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("not linked")]
    NotLinked,
    #[error("flushing")]
    Flushing,
    #[error("end of stream")]
    Eos,
    #[error("not negotiated")]
    NotNegotiated,
    #[error("error")]
    Error,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("could not open engine {name}")]
    EngineOpen { name: String },
    #[error("could not create codec {codec}")]
    CodecCreate { codec: &'static str },
    #[error("failed to configure the codec: status {status}")]
    CodecConfigure { status: i32 },
    #[error("process returned error: {status} {extended_error:08x}")]
    Process { status: i32, extended_error: u32 },
    #[error("unsupported output buffer: {0}")]
    UnsupportedOutputBuffer(UnsupportedReason),
    #[error("unknown buffer identifier {0}")]
    UnknownIdentifier(i32),
    #[error("not implemented: {0}")]
    NotImplemented(Unimplemented),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("access unit of {len} bytes does not fit in the {capacity} bytes input buffer")]
    InputOverflow { len: usize, capacity: usize },
    #[error("downstream returned {0}")]
    Flow(#[from] FlowError),
    #[error("stream failed")]
    StreamFailed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Allocation(_) => ErrorClass::ResourceExhaustion,
            Error::EngineOpen { .. }
            | Error::CodecCreate { .. }
            | Error::CodecConfigure { .. }
            | Error::Process { .. }
            | Error::UnknownIdentifier(_)
            | Error::StreamFailed
            | Error::Other(_) => ErrorClass::Session,
            Error::UnsupportedOutputBuffer(_)
            | Error::Negotiation(_)
            | Error::InvalidState { .. }
            | Error::InputOverflow { .. } => ErrorClass::Configuration,
            Error::NotImplemented(_) => ErrorClass::Unimplemented,
            Error::Flow(_) => ErrorClass::Flow,
        }
    }
}

/// Configuration of a decoder element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Engine to open on the remote processor.
    pub engine_name: String,
    /// Whether to delete codec objects on the engine when they are destroyed. Deletion crashes
    /// the IVA-HD firmware this crate was written against, so it is off by default and the codec
    /// object is abandoned instead.
    pub delete_codec: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            engine_name: DEFAULT_ENGINE_NAME.to_string(),
            delete_codec: false,
        }
    }
}

/// Description of the compressed stream, as proposed by upstream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCaps {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub framerate: Option<Fraction>,
}

impl StreamCaps {
    pub fn new(width: i32, height: i32, framerate: Fraction) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            framerate: Some(framerate),
        }
    }
}

/// Description of the decoded frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputCaps {
    pub format: DecodedFormat,
    pub rowstride: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
}

impl fmt::Display for OutputCaps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "video/x-raw-yuv-strided, format={}, rowstride={}, width={}, height={}, framerate={}",
            String::from_utf8_lossy(&self.format.fourcc()),
            self.rowstride,
            self.width,
            self.height,
            self.framerate
        )
    }
}

/// Answer to the downstream buffers query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    pub min_buffers: u32,
    pub min_width: u32,
    pub min_height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    StreamStart,
    FlushStart,
    FlushStop,
    Eos,
}

/// A compressed frame.
#[derive(Clone, Debug, Default)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Presentation timestamp, in nanoseconds.
    pub timestamp: Option<u64>,
    pub duration: Option<u64>,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>, timestamp: Option<u64>, duration: Option<u64>) -> Self {
        Self {
            data: data.into(),
            timestamp,
            duration,
        }
    }
}

/// Timing of the access unit a frame was decoded from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub timestamp: Option<u64>,
    pub duration: Option<u64>,
}

/// A buffer provided by downstream to receive a decoded frame.
pub struct VideoBuffer {
    memory: Box<dyn BufferMemory>,
}

impl VideoBuffer {
    pub fn new(memory: Box<dyn BufferMemory>) -> Self {
        Self { memory }
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.memory.vaddr()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for VideoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VideoBuffer")
            .field("vaddr", &self.vaddr())
            .field("len", &self.len())
            .finish()
    }
}

/// A decoded frame delivered downstream. The buffer is shared with the decoder until the codec
/// stops referencing it.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub buffer: Rc<VideoBuffer>,
    pub meta: FrameMeta,
}

/// The element's source pad peer.
pub trait Downstream {
    /// Proposes the output format. Returns `false` if it is refused.
    fn set_caps(&mut self, caps: &OutputCaps) -> bool;

    /// Provides a buffer of at least `size` bytes for a frame described by `caps`.
    fn alloc_buffer(
        &mut self,
        size: u32,
        caps: &OutputCaps,
    ) -> std::result::Result<VideoBuffer, FlowError>;

    fn push(&mut self, frame: DecodedFrame) -> std::result::Result<(), FlowError>;

    /// Forwards an event. Returns whether it was handled.
    fn push_event(&mut self, event: Event) -> bool;
}
