// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec variants supported by the IVA-HD.
//!
//! All the decoders share the same orchestration; what differs between codecs is data: the name
//! of the codec on the engine, the size of its parameter blocks, a few parameter overrides and
//! the padding it needs around decoded frames. Each codec implements [`CodecVariant`] by
//! delegating to the shared defaults of this module and adjusting what it needs.

pub mod h264;
pub mod mpeg2;
pub mod mpeg4;
pub mod rv;
pub mod vc1;
pub mod vp6;
pub mod vp7;

use crate::align_up;
use crate::decoder::geometry::Geometry;
use crate::decoder::session::InputStaging;
use crate::decoder::Result;
use crate::engine::ArgBlock;
use crate::engine::BlockSizes;
use crate::engine::BufDesc;
use crate::engine::ChromaFormat;
use crate::engine::DataEndianness;
use crate::engine::DataMode;
use crate::engine::DecodeHeader;
use crate::engine::DecoderStatus;
use crate::engine::DisplayBufsMode;
use crate::engine::DisplayDelay;
use crate::engine::DynamicParams;
use crate::engine::ErrorInfoMode;
use crate::engine::FrameSkip;
use crate::engine::InArgs;
use crate::engine::MetadataPlane;
use crate::engine::OperatingMode;
use crate::engine::OutArgs;
use crate::engine::ParamsExtension;
use crate::engine::SharedAddr;
use crate::engine::SharedHeap;
use crate::engine::VideoDecoderParams;
use crate::engine::BUF_DESC_SIZE;
use crate::memory::AllocationError;

/// Size of a macroblock, the processing unit of the decoders.
pub const MACROBLOCK_SIZE: u32 = 16;

/// Minimum number of output buffers when the codec does not compute its own.
pub const DEFAULT_MIN_BUFFERS: u32 = 8;

/// Maximum frame rate accepted at creation, in frames per 1000 seconds.
pub const DEFAULT_MAX_FRAME_RATE: u32 = 30000;

/// Maximum bit rate accepted at creation, in bits per second.
pub const DEFAULT_MAX_BIT_RATE: u32 = 10_000_000;

/// How decoded frames are padded with respect to the stream resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PaddingRule {
    /// Frames have exactly the stream resolution.
    None,
    /// Frames are rounded up to whole macroblocks.
    Macroblock,
}

impl PaddingRule {
    pub fn apply(&self, width: u32, height: u32) -> (u32, u32) {
        match self {
            PaddingRule::None => (width, height),
            PaddingRule::Macroblock => (
                align_up(width, MACROBLOCK_SIZE),
                align_up(height, MACROBLOCK_SIZE),
            ),
        }
    }
}

/// Static description of a codec variant.
#[derive(Debug)]
pub struct VariantInfo {
    /// Name of the element exposing this codec.
    pub element_name: &'static str,
    pub long_name: &'static str,
    /// Name of the codec on the engine.
    pub codec_name: &'static str,
    /// Caps accepted on the sink pad.
    pub sink_caps: &'static str,
    pub sizes: BlockSizes,
}

/// The blocks exchanged with the engine, allocated from the DSP-shared heap.
#[derive(Debug)]
pub struct ParameterBlocks {
    pub params: ArgBlock<VideoDecoderParams>,
    pub dyn_params: ArgBlock<DynamicParams>,
    pub status: ArgBlock<DecoderStatus>,
    pub in_bufs: ArgBlock<BufDesc>,
    pub out_bufs: ArgBlock<BufDesc>,
    pub in_args: ArgBlock<InArgs>,
    pub out_args: ArgBlock<OutArgs>,
}

impl ParameterBlocks {
    /// Returns every block to `heap`.
    pub fn release(self, heap: &mut dyn SharedHeap) {
        for addr in [
            self.params.addr(),
            self.dyn_params.addr(),
            self.status.addr(),
            self.in_bufs.addr(),
            self.out_bufs.addr(),
            self.in_args.addr(),
            self.out_args.addr(),
        ] {
            heap.free(addr);
        }
    }
}

/// Per-codec behavior of a decoder.
pub trait CodecVariant {
    fn info(&self) -> &'static VariantInfo;

    /// Allocates the parameter blocks from `heap` and fills them for this codec.
    fn allocate_parameters(
        &self,
        heap: &mut dyn SharedHeap,
        sizes: &BlockSizes,
    ) -> std::result::Result<ParameterBlocks, AllocationError>;

    /// Stages `input` for the next process call. Returns the part of `input` that could not be
    /// submitted with this call.
    fn push_input<'a>(&self, input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]>;

    /// Computes the padded frame size and buffer requirements of `geometry`.
    fn update_buffer_size(&self, geometry: &mut Geometry);
}

/// Allocates all the parameter blocks and fills them with the values shared by every codec. If
/// one allocation fails, the blocks already obtained are returned to `heap`.
pub fn allocate_default_parameters(
    heap: &mut dyn SharedHeap,
    sizes: &BlockSizes,
) -> std::result::Result<ParameterBlocks, AllocationError> {
    let requests = [
        ("params", sizes.params),
        ("dynamic params", sizes.dyn_params),
        ("status", sizes.status),
        ("input buffer descriptors", BUF_DESC_SIZE),
        ("output buffer descriptors", BUF_DESC_SIZE),
        ("input arguments", sizes.in_args),
        ("output arguments", sizes.out_args),
    ];

    let mut addrs: Vec<SharedAddr> = Vec::with_capacity(requests.len());
    for (what, size) in requests {
        match heap.alloc(size) {
            Some(addr) => addrs.push(addr),
            None => {
                for addr in addrs {
                    heap.free(addr);
                }
                return Err(AllocationError::SharedHeap { what, size });
            }
        }
    }

    let params = VideoDecoderParams {
        size: sizes.params,
        max_height: 0,
        max_width: 0,
        max_frame_rate: DEFAULT_MAX_FRAME_RATE,
        max_bit_rate: DEFAULT_MAX_BIT_RATE,
        data_endianness: DataEndianness::Byte,
        force_chroma_format: ChromaFormat::Yuv420Sp,
        operating_mode: OperatingMode::DecodeOnly,
        display_delay: DisplayDelay::Auto,
        display_bufs_mode: DisplayBufsMode::Embedded,
        input_data_mode: DataMode::EntireFrame,
        output_data_mode: DataMode::EntireFrame,
        num_input_data_units: 0,
        num_output_data_units: 0,
        metadata_type: [MetadataPlane::None; 3],
        error_info_mode: ErrorInfoMode::Off,
        extension: ParamsExtension::None,
    };

    let dyn_params = DynamicParams {
        size: sizes.dyn_params,
        decode_header: DecodeHeader::AccessUnit,
        display_width: 0,
        frame_skip_mode: FrameSkip::NoSkip,
        new_frame_flag: true,
        late_acquire_arg: None,
    };

    let [
        params_addr,
        dyn_params_addr,
        status_addr,
        in_bufs_addr,
        out_bufs_addr,
        in_args_addr,
        out_args_addr,
    ] = <[SharedAddr; 7]>::try_from(addrs).map_err(|_| AllocationError::SharedHeap {
        what: "params",
        size: sizes.params,
    })?;

    Ok(ParameterBlocks {
        params: ArgBlock::new(params_addr, params),
        dyn_params: ArgBlock::new(dyn_params_addr, dyn_params),
        status: ArgBlock::new(
            status_addr,
            DecoderStatus {
                size: sizes.status,
                ..Default::default()
            },
        ),
        in_bufs: ArgBlock::new(in_bufs_addr, Default::default()),
        out_bufs: ArgBlock::new(out_bufs_addr, Default::default()),
        in_args: ArgBlock::new(
            in_args_addr,
            InArgs {
                size: sizes.in_args,
                ..Default::default()
            },
        ),
        out_args: ArgBlock::new(
            out_args_addr,
            OutArgs {
                size: sizes.out_args,
                ..Default::default()
            },
        ),
    })
}

/// Submits the whole of `input` as a single access unit.
pub fn default_push_input<'a>(input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]> {
    staging.submit(input)?;
    Ok(&input[input.len()..])
}

/// Pads the frame according to `padding` and asks for [`DEFAULT_MIN_BUFFERS`] buffers.
pub fn default_update_buffer_size(geometry: &mut Geometry, padding: PaddingRule) {
    let (padded_width, padded_height) = padding.apply(geometry.width, geometry.height);
    geometry.padded_width = padded_width;
    geometry.padded_height = padded_height;
    geometry.min_buffers = DEFAULT_MIN_BUFFERS;
}
