// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

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
use crate::engine::SharedHeap;
use crate::memory::AllocationError;

pub static INFO: VariantInfo = VariantInfo {
    element_name: "ducatimpeg2dec",
    long_name: "DucatiMpeg2Dec",
    codec_name: "ivahd_mpeg2vdec",
    sink_caps: "video/mpeg, mpegversion=[1, 2], systemstream=false",
    sizes: BlockSizes::BASE,
};

pub struct Mpeg2;

impl CodecVariant for Mpeg2 {
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
        default_update_buffer_size(geometry, PaddingRule::Macroblock)
    }
}
