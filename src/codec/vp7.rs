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
    element_name: "ducativp7dec",
    long_name: "DucatiVp7Dec",
    codec_name: "ivahd_vp7vdec",
    sink_caps: "video/x-vp7",
    sizes: BlockSizes::BASE,
};

pub struct Vp7;

impl CodecVariant for Vp7 {
    fn info(&self) -> &'static VariantInfo {
        &INFO
    }

    fn allocate_parameters(
        &self,
        heap: &mut dyn SharedHeap,
        sizes: &BlockSizes,
    ) -> std::result::Result<ParameterBlocks, AllocationError> {
        let mut blocks = allocate_default_parameters(heap, sizes)?;
        blocks.params.num_input_data_units = 1;
        blocks.params.num_output_data_units = 1;
        Ok(blocks)
    }

    fn push_input<'a>(&self, input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]> {
        default_push_input(input, staging)
    }

    fn update_buffer_size(&self, geometry: &mut Geometry) {
        default_update_buffer_size(geometry, PaddingRule::None)
    }
}
