// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 (WMV3 and WVC1) decoder.

use crate::codec::allocate_default_parameters;
use crate::codec::default_push_input;
use crate::codec::default_update_buffer_size;
use crate::codec::CodecVariant;
use crate::codec::PaddingRule;
use crate::codec::ParameterBlocks;
use crate::codec::VariantInfo;
use crate::decoder::geometry::Geometry;
use crate::decoder::session::InputStaging;
use crate::decoder::Result;
use crate::engine::BlockSizes;
use crate::engine::DisplayDelay;
use crate::engine::SharedHeap;
use crate::memory::AllocationError;

/// Advanced profile, level 3.
const MAX_BIT_RATE: u32 = 45_000_000;

pub static INFO: VariantInfo = VariantInfo {
    element_name: "ducativc1dec",
    long_name: "DucatiVc1Dec",
    codec_name: "ivahd_vc1vdec",
    sink_caps: "video/x-wmv, wmvversion=3, format={WVC1, WMV3}",
    sizes: BlockSizes::BASE,
};

pub struct Vc1;

impl CodecVariant for Vc1 {
    fn info(&self) -> &'static VariantInfo {
        &INFO
    }

    fn allocate_parameters(
        &self,
        heap: &mut dyn SharedHeap,
        sizes: &BlockSizes,
    ) -> std::result::Result<ParameterBlocks, AllocationError> {
        let mut blocks = allocate_default_parameters(heap, sizes)?;
        blocks.params.max_bit_rate = MAX_BIT_RATE;
        blocks.params.display_delay = DisplayDelay::Frames(1);
        Ok(blocks)
    }

    fn push_input<'a>(&self, input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]> {
        default_push_input(input, staging)
    }

    fn update_buffer_size(&self, geometry: &mut Geometry) {
        default_update_buffer_size(geometry, PaddingRule::Macroblock)
    }
}
