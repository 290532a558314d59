// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the remote codec engine.
//!
//! The codec engine runs on the IVA-HD subsystem and is driven through a small RPC surface:
//! open an engine, create a codec on it, configure it with a control call, then submit frames with
//! a blocking process call. Arguments are exchanged through fixed-layout blocks allocated from a
//! heap shared with the DSP. [`CodecEngine`] is that surface; this module also defines the blocks.

#[cfg(any(test, feature = "simulator"))]
pub mod simulated;

use enumn::N;

use crate::memory::MemoryKind;
use crate::memory::PhysAddr;

/// Name of the IVA-HD video server engine.
pub const DEFAULT_ENGINE_NAME: &str = "ivahd_vidsvr";

/// Length of the output and freed identifier lists of [`OutArgs`].
pub const MAX_IO_BUFFERS: usize = 20;

/// Number of buffer descriptors in a [`BufDesc`].
pub const MAX_BUF_DESCS: usize = 16;

/// Address of a block allocated from the DSP-shared heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedAddr(pub usize);

/// Status codes returned by the control and process calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum EngineStatus {
    Ok = 0,
    Fail = -1,
    Unsupported = -3,
}

impl EngineStatus {
    /// Human-readable name of a raw status code.
    pub fn describe(code: i32) -> &'static str {
        match Self::n(code) {
            Some(EngineStatus::Ok) => "ok",
            Some(EngineStatus::Fail) => "failure",
            Some(EngineStatus::Unsupported) => "unsupported",
            None => "unknown status",
        }
    }
}

/// Commands accepted by [`CodecEngine::control`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlCommand {
    GetStatus = 0,
    SetParams = 1,
    Reset = 2,
    SetDefault = 3,
    Flush = 4,
    GetBufInfo = 5,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataEndianness {
    Byte,
    LeWord16,
    LeWord32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420P,
    Yuv420Sp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    DecodeOnly,
    TranscodeFrameLevel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayDelay {
    /// Let the codec decide.
    Auto,
    Frames(u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayBufsMode {
    /// Display buffer descriptors are embedded in the output arguments.
    Embedded,
    Pointers,
}

/// Granularity of the data exchanged with the codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataMode {
    EntireFrame,
    Slice,
    NumRows,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataPlane {
    None,
    MbInfo,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorInfoMode {
    Off,
    On,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeHeader {
    AccessUnit,
    HeaderOnly,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameSkip {
    NoSkip,
    SkipP,
    SkipB,
    SkipI,
}

/// Codec-specific creation parameters appended to [`VideoDecoderParams`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamsExtension {
    None,
    Mpeg4 {
        outloop_deblocking: bool,
        sorenson_spark_stream: bool,
        error_concealment: bool,
    },
}

/// Creation parameters of a decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoDecoderParams {
    pub size: u32,
    pub max_height: u32,
    pub max_width: u32,
    /// Frames per 1000 seconds.
    pub max_frame_rate: u32,
    /// Bits per second.
    pub max_bit_rate: u32,
    pub data_endianness: DataEndianness,
    pub force_chroma_format: ChromaFormat,
    pub operating_mode: OperatingMode,
    pub display_delay: DisplayDelay,
    pub display_bufs_mode: DisplayBufsMode,
    pub input_data_mode: DataMode,
    pub output_data_mode: DataMode,
    pub num_input_data_units: u32,
    pub num_output_data_units: u32,
    pub metadata_type: [MetadataPlane; 3],
    pub error_info_mode: ErrorInfoMode,
    pub extension: ParamsExtension,
}

/// Run-time parameters, applied with [`ControlCommand::SetParams`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicParams {
    pub size: u32,
    pub decode_header: DecodeHeader,
    pub display_width: u32,
    pub frame_skip_mode: FrameSkip,
    pub new_frame_flag: bool,
    pub late_acquire_arg: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderStatus {
    pub size: u32,
    pub extended_error: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufSize {
    Bytes(u32),
    Tiled { width: u32, height: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub buf: PhysAddr,
    /// Raw [`MemoryKind`] code.
    pub mem_type: i16,
    pub size: BufSize,
}

impl BufferDesc {
    pub fn mem_kind(&self) -> Option<MemoryKind> {
        MemoryKind::n(self.mem_type)
    }
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            buf: PhysAddr(0),
            mem_type: MemoryKind::Raw as i16,
            size: BufSize::Bytes(0),
        }
    }
}

/// A set of buffers exchanged with the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufDesc {
    pub num_bufs: u32,
    pub descs: [BufferDesc; MAX_BUF_DESCS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InArgs {
    pub size: u32,
    pub num_bytes: u32,
    /// Identifier of the output buffer the codec may decode into. Zero is not a valid identifier.
    pub input_id: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutArgs {
    pub size: u32,
    pub extended_error: u32,
    pub bytes_consumed: u32,
    /// Buffers ready for display, in display order, zero-terminated.
    pub output_id: [i32; MAX_IO_BUFFERS],
    /// Buffers the codec does not reference anymore, zero-terminated.
    pub free_buf_id: [i32; MAX_IO_BUFFERS],
    /// Whether the codec still holds output buffers after this call.
    pub out_bufs_in_use: bool,
}

/// Byte sizes of the blocks exchanged with a given codec. Codecs extend the base structures with
/// their own fields, so each one declares its sizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockSizes {
    pub params: u32,
    pub dyn_params: u32,
    pub status: u32,
    pub in_args: u32,
    pub out_args: u32,
}

impl BlockSizes {
    /// Sizes of the base video decoder structures.
    pub const BASE: BlockSizes = BlockSizes {
        params: 72,
        dyn_params: 48,
        status: 244,
        in_args: 12,
        out_args: 752,
    };

    /// Base sizes with `params` and `dyn_params` extended by the given number of 32-bit fields.
    pub const fn extended(params_fields: u32, dyn_params_fields: u32) -> Self {
        Self {
            params: Self::BASE.params + 4 * params_fields,
            dyn_params: Self::BASE.dyn_params + 4 * dyn_params_fields,
            ..Self::BASE
        }
    }
}

/// Byte size of a [`BufDesc`] in the shared heap.
pub const BUF_DESC_SIZE: u32 = 4 + 16 * MAX_BUF_DESCS as u32;

/// A value living in a block of the DSP-shared heap.
#[derive(Debug)]
pub struct ArgBlock<T> {
    addr: SharedAddr,
    value: T,
}

impl<T> ArgBlock<T> {
    pub fn new(addr: SharedAddr, value: T) -> Self {
        Self { addr, value }
    }

    pub fn addr(&self) -> SharedAddr {
        self.addr
    }
}

impl<T> std::ops::Deref for ArgBlock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for ArgBlock<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Allocator of DSP-shared heap blocks.
pub trait SharedHeap {
    fn alloc(&mut self, size: u32) -> Option<SharedAddr>;
    fn free(&mut self, addr: SharedAddr);
}

/// The remote codec engine.
///
/// Every call is a blocking round-trip to the DSP. Calls on a given codec must not overlap.
pub trait CodecEngine {
    /// An open engine.
    type Session;
    /// A codec instance created on an engine.
    type Codec;

    /// Opens the engine called `name`.
    fn open(&mut self, name: &str) -> Option<Self::Session>;

    /// Closes an engine. Codecs created on it must not be used anymore.
    fn close(&mut self, session: Self::Session);

    /// Allocates `size` bytes from the heap shared with the DSP.
    fn alloc_shared(&mut self, size: u32) -> Option<SharedAddr>;

    fn free_shared(&mut self, addr: SharedAddr);

    /// Creates the codec called `codec_name`. `params` must be fully populated.
    fn create(
        &mut self,
        session: &mut Self::Session,
        codec_name: &str,
        params: &VideoDecoderParams,
    ) -> Option<Self::Codec>;

    /// Sends a control command, returning a status code.
    fn control(
        &mut self,
        codec: &mut Self::Codec,
        cmd: ControlCommand,
        dyn_params: &DynamicParams,
        status: &mut DecoderStatus,
    ) -> i32;

    /// Decodes the access unit described by `in_bufs` and `in_args` into the buffer described by
    /// `out_bufs`, returning a status code. The result lists are written to `out_args`.
    fn process(
        &mut self,
        codec: &mut Self::Codec,
        in_bufs: &BufDesc,
        out_bufs: &BufDesc,
        in_args: &InArgs,
        out_args: &mut OutArgs,
    ) -> i32;

    /// Deletes a codec.
    fn delete(&mut self, codec: Self::Codec);
}

/// Exposes the shared heap of an engine through the object-safe [`SharedHeap`] trait.
pub struct EngineHeap<'a, E: CodecEngine>(pub &'a mut E);

impl<E: CodecEngine> SharedHeap for EngineHeap<'_, E> {
    fn alloc(&mut self, size: u32) -> Option<SharedAddr> {
        self.0.alloc_shared(size)
    }

    fn free(&mut self, addr: SharedAddr) {
        self.0.free_shared(addr)
    }
}

/// Reads a zero-terminated identifier list.
pub fn id_list(ids: &[i32]) -> impl Iterator<Item = i32> + '_ {
    ids.iter().copied().take_while(|&id| id != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lists_stop_at_zero() {
        let mut ids = [0; MAX_IO_BUFFERS];
        assert_eq!(id_list(&ids).count(), 0);

        ids[0] = 3;
        ids[1] = 1;
        ids[3] = 9;
        assert_eq!(id_list(&ids).collect::<Vec<_>>(), vec![3, 1]);

        let full = [5; MAX_IO_BUFFERS];
        assert_eq!(id_list(&full).count(), MAX_IO_BUFFERS);
    }

    #[test]
    fn status_names() {
        assert_eq!(EngineStatus::describe(0), "ok");
        assert_eq!(EngineStatus::describe(-1), "failure");
        assert_eq!(EngineStatus::describe(42), "unknown status");
    }

    #[test]
    fn extended_sizes() {
        let sizes = BlockSizes::extended(3, 1);
        assert_eq!(sizes.params, BlockSizes::BASE.params + 12);
        assert_eq!(sizes.dyn_params, BlockSizes::BASE.dyn_params + 4);
        assert_eq!(sizes.out_args, BlockSizes::BASE.out_args);
    }
}
