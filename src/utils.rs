// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reading of IVF files, the container used to feed compressed frames to the decoders outside of a
//! pipeline.

use std::io::Cursor;
use std::io::Read;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use bytes::Buf;
use thiserror::Error;

use crate::Fraction;

#[derive(Debug, Error)]
pub enum IvfError {
    #[error("file too short for an IVF header")]
    Truncated,
    #[error("bad IVF signature {0:?}")]
    BadSignature([u8; 4]),
    #[error("unsupported IVF header size {0}")]
    BadHeaderSize(u16),
}

/// Header at the start of an IVF file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub version: u16,
    pub header_size: u16,
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Frame rate numerator (time base denominator).
    pub framerate: u32,
    pub timescale: u32,
    pub frame_count: u32,
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const SIZE: u16 = 32;

    pub fn new(fourcc: [u8; 4], width: u16, height: u16, framerate: u32, frame_count: u32) -> Self {
        Self {
            version: 0,
            header_size: Self::SIZE,
            fourcc,
            width,
            height,
            framerate,
            timescale: 1,
            frame_count,
        }
    }

    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, IvfError> {
        let mut cursor = Cursor::new(data);
        let truncated = |_| IvfError::Truncated;

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic).map_err(truncated)?;
        if magic != Self::MAGIC {
            return Err(IvfError::BadSignature(magic));
        }

        let version = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let header_size = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        if header_size < Self::SIZE {
            return Err(IvfError::BadHeaderSize(header_size));
        }
        let mut fourcc = [0u8; 4];
        cursor.read_exact(&mut fourcc).map_err(truncated)?;

        let header = Self {
            version,
            header_size,
            fourcc,
            width: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            height: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            framerate: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            timescale: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            frame_count: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
        };

        if data.len() < header_size as usize {
            return Err(IvfError::Truncated);
        }

        Ok(header)
    }

    pub fn framerate(&self) -> Fraction {
        Fraction::new(
            i32::try_from(self.framerate).unwrap_or(i32::MAX),
            i32::try_from(self.timescale).unwrap_or(i32::MAX),
        )
    }

    /// Writes the header into `writer`.
    pub fn write_into(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        writer.write_all(&Self::MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.header_size.to_le_bytes())?;
        writer.write_all(&self.fourcc)?;
        writer.write_all(&self.width.to_le_bytes())?;
        writer.write_all(&self.height.to_le_bytes())?;
        writer.write_all(&self.framerate.to_le_bytes())?;
        writer.write_all(&self.timescale.to_le_bytes())?;
        writer.write_all(&self.frame_count.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

/// Header preceding each frame of an IVF file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IvfFrameHeader {
    pub frame_size: u32,
    /// Presentation time, in time base units.
    pub timestamp: u64,
}

impl IvfFrameHeader {
    pub const SIZE: usize = 12;

    pub fn write_into(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        writer.write_all(&self.frame_size.to_le_bytes())?;
        writer.write_all(&self.timestamp.to_le_bytes())?;
        Ok(())
    }
}

/// Iterator over the frames of an IVF file. Stops at the first truncated frame.
pub struct IvfIterator<'a> {
    data: &'a [u8],
}

impl<'a> IvfIterator<'a> {
    /// Iterates over the frames of `data`, a whole IVF file.
    pub fn new(data: &'a [u8]) -> Result<(IvfFileHeader, Self), IvfError> {
        let header = IvfFileHeader::parse(data)?;
        let data = &data[header.header_size as usize..];
        Ok((header, Self { data }))
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = (IvfFrameHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.remaining() < IvfFrameHeader::SIZE {
            return None;
        }

        let mut data = self.data;
        let header = IvfFrameHeader {
            frame_size: data.get_u32_le(),
            timestamp: data.get_u64_le(),
        };
        let len = header.frame_size as usize;
        if data.remaining() < len {
            log::warn!("truncated IVF frame: {} bytes of {}", data.remaining(), len);
            return None;
        }

        let (frame, rest) = data.split_at(len);
        self.data = rest;
        Some((header, frame))
    }
}
