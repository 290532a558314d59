// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output geometry derived from the stream description.

use crate::align_up;
use crate::codec::CodecVariant;
use crate::codec::DEFAULT_MIN_BUFFERS;
use crate::decoder::BufferRequirements;
use crate::decoder::NegotiationError;
use crate::decoder::OutputCaps;
use crate::decoder::StreamCaps;
use crate::memory::TILER_STRIDE;
use crate::DecodedFormat;
use crate::Fraction;
use crate::Resolution;

/// Negotiated stream geometry and the sizes derived from it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Stream resolution.
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    /// Row stride of the output frames, in bytes.
    pub stride: u32,
    /// Resolution of the decoded frames, including codec padding.
    pub padded_width: u32,
    pub padded_height: u32,
    /// Byte size of an output buffer.
    pub outsize: u32,
    /// Number of output buffers the codec needs to operate.
    pub min_buffers: u32,
}

impl Geometry {
    /// Unpadded geometry for a stream, before the codec adjusts it.
    pub fn new(width: u32, height: u32, framerate: Fraction) -> Self {
        Self {
            width,
            height,
            framerate,
            stride: TILER_STRIDE,
            padded_width: width,
            padded_height: height,
            outsize: 0,
            min_buffers: DEFAULT_MIN_BUFFERS,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    pub fn padded_resolution(&self) -> Resolution {
        Resolution::from((self.padded_width, self.padded_height))
    }

    /// Offset of the chroma plane from the start of an output buffer. The luma plane of tiled
    /// frames spans an even number of lines.
    pub fn chroma_offset(&self) -> usize {
        self.stride as usize * align_up(self.padded_height, 2) as usize
    }

    pub fn output_caps(&self) -> OutputCaps {
        OutputCaps {
            format: DecodedFormat::NV12,
            rowstride: self.stride,
            width: self.padded_width,
            height: self.padded_height,
            framerate: self.framerate,
        }
    }

    pub fn requirements(&self) -> BufferRequirements {
        BufferRequirements {
            min_buffers: self.min_buffers,
            min_width: self.padded_width,
            min_height: self.padded_height,
        }
    }
}

fn dimension(value: Option<i32>, field: &'static str) -> Result<u32, NegotiationError> {
    let value = value.ok_or(NegotiationError::MissingField(field))?;
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(NegotiationError::InvalidField {
            field,
            value: value.to_string(),
        }),
    }
}

/// Derives the output geometry of a stream decoded with `variant`.
pub fn negotiate(
    caps: &StreamCaps,
    variant: &dyn CodecVariant,
) -> Result<Geometry, NegotiationError> {
    let width = dimension(caps.width, "width")?;
    let height = dimension(caps.height, "height")?;
    let framerate = caps
        .framerate
        .ok_or(NegotiationError::MissingField("framerate"))?;
    if framerate.den <= 0 || framerate.num < 0 {
        return Err(NegotiationError::InvalidField {
            field: "framerate",
            value: framerate.to_string(),
        });
    }

    let too_large = || NegotiationError::InvalidField {
        field: "resolution",
        value: format!("{}x{}", width, height),
    };
    // The input buffer holds width x height bytes.
    width.checked_mul(height).ok_or_else(too_large)?;

    let mut geometry = Geometry::new(width, height, framerate);
    variant.update_buffer_size(&mut geometry);

    let frame_bytes = geometry
        .stride
        .checked_mul(geometry.padded_height)
        .and_then(|b| b.checked_mul(3))
        .filter(|b| *b < u32::MAX)
        .ok_or_else(too_large)?;
    geometry.outsize = align_up(frame_bytes, 2) / 2;

    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::H264;
    use crate::codec::vp6::Vp6;

    #[test]
    fn hd_stream() {
        let caps = StreamCaps::new(1280, 720, Fraction::new(30000, 1));
        let geometry = negotiate(&caps, &H264).unwrap();

        assert_eq!(geometry.stride, 4096);
        assert_eq!(geometry.padded_width, 1280);
        assert_eq!(geometry.padded_height, 720);
        assert_eq!(geometry.outsize, 4423680);
        assert_eq!(geometry.chroma_offset(), 4096 * 720);

        let out = geometry.output_caps();
        assert_eq!(out.rowstride, 4096);
        assert_eq!((out.width, out.height), (1280, 720));
        assert_eq!(out.framerate, Fraction::new(30000, 1));
    }

    #[test]
    fn padding_is_codec_specific() {
        let caps = StreamCaps::new(1920, 1080, Fraction::new(24, 1));

        let h264 = negotiate(&caps, &H264).unwrap();
        assert_eq!(h264.padded_resolution(), Resolution::from((1920, 1088)));
        assert_eq!(h264.outsize, 4096 * 1088 * 3 / 2);
        assert_eq!(
            h264.requirements(),
            BufferRequirements {
                min_buffers: 7,
                min_width: 1920,
                min_height: 1088,
            }
        );

        let vp6 = negotiate(&caps, &Vp6).unwrap();
        assert_eq!(vp6.padded_resolution(), Resolution::from((1920, 1080)));
        assert_eq!(vp6.resolution(), vp6.padded_resolution());
    }

    #[test]
    fn odd_padded_height() {
        let caps = StreamCaps::new(176, 145, Fraction::new(15, 1));
        let geometry = negotiate(&caps, &Vp6).unwrap();
        assert_eq!(geometry.outsize, (4096 * 145 * 3) / 2);
        assert_eq!(geometry.chroma_offset(), 4096 * 146);
    }

    #[test]
    fn missing_fields() {
        let full = StreamCaps::new(640, 480, Fraction::new(30, 1));

        let caps = StreamCaps {
            width: None,
            ..full
        };
        assert_eq!(
            negotiate(&caps, &H264).unwrap_err(),
            NegotiationError::MissingField("width")
        );

        let caps = StreamCaps {
            height: None,
            ..full
        };
        assert_eq!(
            negotiate(&caps, &H264).unwrap_err(),
            NegotiationError::MissingField("height")
        );

        let caps = StreamCaps {
            framerate: None,
            ..full
        };
        assert_eq!(
            negotiate(&caps, &H264).unwrap_err(),
            NegotiationError::MissingField("framerate")
        );
    }

    #[test]
    fn invalid_fields() {
        let caps = StreamCaps::new(0, 480, Fraction::new(30, 1));
        assert!(matches!(
            negotiate(&caps, &H264),
            Err(NegotiationError::InvalidField { field: "width", .. })
        ));

        let caps = StreamCaps::new(640, -1, Fraction::new(30, 1));
        assert!(matches!(
            negotiate(&caps, &H264),
            Err(NegotiationError::InvalidField {
                field: "height",
                ..
            })
        ));

        let caps = StreamCaps::new(640, 480, Fraction::new(30, 0));
        assert!(matches!(
            negotiate(&caps, &H264),
            Err(NegotiationError::InvalidField {
                field: "framerate",
                ..
            })
        ));

        let caps = StreamCaps::new(1 << 20, 1 << 20, Fraction::new(30, 1));
        assert!(matches!(
            negotiate(&caps, &H264),
            Err(NegotiationError::InvalidField {
                field: "resolution",
                ..
            })
        ));
    }
}
