// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-4 part 2 decoder, also used for H.263 and the DivX/Xvid flavors.

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
use crate::engine::ParamsExtension;
use crate::engine::SharedHeap;
use crate::memory::AllocationError;

/// Lets the HDVICP2 resource manager pick the late acquire argument.
pub const UNKNOWN_LATE_ACQUIRE_ARG: i32 = -1;

pub static INFO: VariantInfo = VariantInfo {
    element_name: "ducatimpeg4dec",
    long_name: "DucatiMpeg4Dec",
    codec_name: "ivahd_mpeg4dec",
    sink_caps: "video/mpeg, mpegversion=4, systemstream=false; \
                video/x-divx, divxversion=[4, 5]; video/x-xvid; video/x-h263",
    // outloopDeBlocking, sorensonSparkStream, ErrorConcealmentON / lateAcquireArg
    sizes: BlockSizes::extended(3, 1),
};

pub struct Mpeg4;

impl CodecVariant for Mpeg4 {
    fn info(&self) -> &'static VariantInfo {
        &INFO
    }

    fn allocate_parameters(
        &self,
        heap: &mut dyn SharedHeap,
        sizes: &BlockSizes,
    ) -> std::result::Result<ParameterBlocks, AllocationError> {
        let mut blocks = allocate_default_parameters(heap, sizes)?;

        blocks.params.display_delay = DisplayDelay::Frames(1);
        blocks.params.extension = ParamsExtension::Mpeg4 {
            outloop_deblocking: false,
            sorenson_spark_stream: false,
            error_concealment: true,
        };
        blocks.dyn_params.late_acquire_arg = Some(UNKNOWN_LATE_ACQUIRE_ARG);

        Ok(blocks)
    }

    fn push_input<'a>(&self, input: &'a [u8], staging: &mut InputStaging) -> Result<&'a [u8]> {
        default_push_input(input, staging)
    }

    fn update_buffer_size(&self, geometry: &mut Geometry) {
        default_update_buffer_size(geometry, PaddingRule::Macroblock)
    }
}
