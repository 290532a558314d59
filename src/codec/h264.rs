// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decoder.

use std::cmp::min;

use crate::codec::allocate_default_parameters;
use crate::codec::default_push_input;
use crate::codec::default_update_buffer_size;
use crate::codec::CodecVariant;
use crate::codec::PaddingRule;
use crate::codec::ParameterBlocks;
use crate::codec::VariantInfo;
use crate::codec::MACROBLOCK_SIZE;
use crate::decoder::geometry::Geometry;
use crate::decoder::session::InputStaging;
use crate::decoder::Result;
use crate::engine::BlockSizes;
use crate::engine::SharedHeap;
use crate::memory::AllocationError;

/// MaxDpbMbs of level 4.1, the highest level the IVA-HD decodes.
const MAX_DPB_MBS: u32 = 32768;
const MAX_DPB_FRAMES: u32 = 16;
/// Buffers needed on top of the DPB: the one being decoded and two held downstream.
const EXTRA_BUFFERS: u32 = 3;

pub static INFO: VariantInfo = VariantInfo {
    element_name: "ducatih264dec",
    long_name: "DucatiH264Dec",
    codec_name: "ivahd_h264dec",
    sink_caps: "video/x-h264",
    sizes: BlockSizes::BASE,
};

pub struct H264;

impl CodecVariant for H264 {
    fn info(&self) -> &'static VariantInfo {
        &INFO
    }

    fn allocate_parameters(
        &self,
        heap: &mut dyn SharedHeap,
        sizes: &BlockSizes,
    ) -> std::result::Result<ParameterBlocks, AllocationError> {
        allocate_default_parameters(heap, sizes)
    }

    fn push_input<'a>(&self, input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]> {
        default_push_input(input, staging)
    }

    fn update_buffer_size(&self, geometry: &mut Geometry) {
        default_update_buffer_size(geometry, PaddingRule::Macroblock);

        let mbs = (geometry.padded_width / MACROBLOCK_SIZE)
            * (geometry.padded_height / MACROBLOCK_SIZE);
        geometry.min_buffers = min(MAX_DPB_FRAMES, MAX_DPB_MBS / mbs.max(1)) + EXTRA_BUFFERS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fraction;

    fn buffers_for(width: u32, height: u32) -> (u32, u32, u32) {
        let mut geometry = Geometry::new(width, height, Fraction::new(30, 1));
        H264.update_buffer_size(&mut geometry);
        (
            geometry.padded_width,
            geometry.padded_height,
            geometry.min_buffers,
        )
    }

    #[test]
    fn dpb_size_follows_resolution() {
        assert_eq!(buffers_for(1280, 720), (1280, 720, 12));
        assert_eq!(buffers_for(1920, 1080), (1920, 1088, 7));
        // Small pictures are capped by the maximum number of reference frames.
        assert_eq!(buffers_for(176, 144), (176, 144, 19));
    }
}
