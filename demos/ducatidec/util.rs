// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum EncodedFormat {
    H264,
    Mpeg4,
    Mpeg2,
    Vc1,
    Vp6,
    Vp7,
    RealVideo,
}

impl EncodedFormat {
    /// Name of the element decoding this format.
    pub fn element_name(&self) -> &'static str {
        match self {
            EncodedFormat::H264 => "ducatih264dec",
            EncodedFormat::Mpeg4 => "ducatimpeg4dec",
            EncodedFormat::Mpeg2 => "ducatimpeg2dec",
            EncodedFormat::Vc1 => "ducativc1dec",
            EncodedFormat::Vp6 => "ducativp6dec",
            EncodedFormat::Vp7 => "ducativp7dec",
            EncodedFormat::RealVideo => "ducatirvdec",
        }
    }

    /// Guesses the format from the fourcc of an IVF file.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"H264" | b"h264" | b"avc1" => Some(EncodedFormat::H264),
            b"MP4V" | b"mp4v" | b"XVID" | b"DIVX" => Some(EncodedFormat::Mpeg4),
            b"MPG2" | b"mpg2" => Some(EncodedFormat::Mpeg2),
            b"WVC1" | b"WMV3" => Some(EncodedFormat::Vc1),
            b"VP60" | b"VP61" | b"VP62" | b"VP6F" => Some(EncodedFormat::Vp6),
            b"VP70" | b"VP71" => Some(EncodedFormat::Vp7),
            b"RV30" | b"RV40" => Some(EncodedFormat::RealVideo),
            _ => None,
        }
    }
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "mpeg4" | "MPEG4" => Ok(EncodedFormat::Mpeg4),
            "mpeg2" | "MPEG2" => Ok(EncodedFormat::Mpeg2),
            "vc1" | "VC1" => Ok(EncodedFormat::Vc1),
            "vp6" | "VP6" => Ok(EncodedFormat::Vp6),
            "vp7" | "VP7" => Ok(EncodedFormat::Vp7),
            "rv" | "RV" => Ok(EncodedFormat::RealVideo),
            _ => Err("unrecognized input format. \
                Valid values: h264, mpeg4, mpeg2, vc1, vp6, vp7, rv"),
        }
    }
}

/// Decodes an IVF file through the simulated IVA-HD and prints a checksum of every frame
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file
    #[argh(positional)]
    pub input: PathBuf,

    /// input format, guessed from the IVF fourcc if absent
    #[argh(option)]
    pub codec: Option<EncodedFormat>,

    /// stop after this many frames
    #[argh(option)]
    pub frames: Option<usize>,

    /// make the codec fail on this frame
    #[argh(option)]
    pub fail_at: Option<usize>,

    /// delete the codec on teardown
    #[argh(switch)]
    pub delete_codec: bool,
}
