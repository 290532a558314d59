// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware video decoders for the IVA-HD ("Ducati") subsystem of OMAP4 SoCs.
//!
//! The decoding itself happens on a remote DSP reached through a codec engine; this crate only
//! orchestrates it. It negotiates the stream geometry, allocates tiled physical memory for the
//! output frames, maps the engine's numeric buffer identifiers back to pipeline buffers and drives
//! the synchronous process call.
//!
//! The two external systems are reached through narrow traits: [`memory::MemoryManager`] for the
//! tiled memory allocator and [`engine::CodecEngine`] for the codec engine. Software
//! implementations of both live in `memory::simulated` and `engine::simulated` (enabled with the
//! `simulator` feature).

pub mod codec;
pub mod decoder;
pub mod engine;
pub mod frame_pool;
pub mod memory;
pub mod plugin;
pub mod utils;

use std::fmt;
use std::str::FromStr;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + (alignment - 1)) & !(alignment - 1)
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// A rational number, used for frame rates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Pixel layouts the decoders can produce. The IVA-HD only writes NV12: an 8-bit luma plane
/// followed by an interleaved, 2x2 subsampled chroma plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
}

impl DecodedFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            DecodedFormat::NV12 => *b"NV12",
        }
    }
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            _ => Err("unrecognized output format. Valid values: nv12"),
        }
    }
}
