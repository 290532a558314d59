// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RealVideo 8/9/10 decoder.

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
    element_name: "ducatirvdec",
    long_name: "DucatiRvDec",
    codec_name: "ivahd_realvdec",
    sink_caps: "video/x-pn-realvideo, rmversion=[3, 4]",
    sizes: BlockSizes::BASE,
};

pub struct RealVideo;

impl CodecVariant for RealVideo {
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
        default_update_buffer_size(geometry, PaddingRule::None)
    }
}
