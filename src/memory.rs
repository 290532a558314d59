// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physical memory for the IVA-HD.
//!
//! The decoder can only read its bitstream from, and write its frames to, memory it can address
//! physically. On OMAP4 this memory comes from the TILER, which hands out 1-D page-mode regions
//! and 2-D tiled regions with a fixed 4096-byte row stride. This module wraps the platform
//! allocator behind the [`MemoryManager`] trait and provides the [`TilerAllocator`] adapter used
//! by the rest of the crate.

#[cfg(any(test, feature = "simulator"))]
pub mod simulated;

use std::fmt;
use std::rc::Rc;

use enumn::N;
use nix::unistd::sysconf;
use nix::unistd::SysconfVar;
use thiserror::Error;

use crate::align_up;

/// Row stride of every 2-D TILER allocation, in bytes.
pub const TILER_STRIDE: u32 = 4096;

const DEFAULT_PAGE_SIZE: u32 = 4096;

/// A CPU-side virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// An address as seen by the remote DSP.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u32);

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Memory types understood by the codec engine, with their XDM numeric codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(i16)]
pub enum MemoryKind {
    Raw = 0,
    Tiled8 = 1,
    Tiled16 = 2,
    Tiled32 = 3,
    TiledPage = 4,
}

/// Physical address windows of the TILER container, as `(start, end, kind)` half-open ranges.
const REGIONS: [(u32, u32, MemoryKind); 4] = [
    (0x6000_0000, 0x6800_0000, MemoryKind::Tiled8),
    (0x6800_0000, 0x7000_0000, MemoryKind::Tiled16),
    (0x7000_0000, 0x7800_0000, MemoryKind::Tiled32),
    (0x7800_0000, 0x8000_0000, MemoryKind::Raw),
];

/// Returns the kind of memory `addr` falls into, or `None` if it is outside of every known region.
pub fn classify_region(addr: PhysAddr) -> Option<MemoryKind> {
    REGIONS
        .iter()
        .find(|(start, end, _)| (*start..*end).contains(&addr.0))
        .map(|(_, _, kind)| *kind)
}

/// Container format of a single block requested from the platform allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 1-D page mode.
    Page,
    Bit8,
    Bit16,
    Bit32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Page | PixelFormat::Bit8 => 1,
            PixelFormat::Bit16 => 2,
            PixelFormat::Bit32 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockDim {
    Length(u32),
    Area { width: u32, height: u32 },
}

/// One block of an allocation request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocBlock {
    pub pixel_format: PixelFormat,
    pub dim: BlockDim,
    /// Row stride for 2-D blocks, ignored for 1-D ones.
    pub stride: u32,
}

impl AllocBlock {
    /// Number of bytes this block spans in the virtual mapping.
    pub fn mapped_size(&self) -> usize {
        match self.dim {
            BlockDim::Length(len) => len as usize,
            BlockDim::Area { width, height } => {
                let stride = if self.stride != 0 {
                    self.stride
                } else {
                    width * self.pixel_format.bytes_per_pixel()
                };
                stride as usize * height as usize
            }
        }
    }
}

/// Platform memory manager interface.
///
/// All the blocks passed to a single [`alloc`](MemoryManager::alloc) call are mapped contiguously
/// in virtual memory, in order, and released together by [`free`](MemoryManager::free).
pub trait MemoryManager {
    /// Allocates `blocks`, returning the virtual address of the first one.
    fn alloc(&self, blocks: &[AllocBlock]) -> Option<VirtAddr>;

    /// Releases an allocation previously returned by `alloc`.
    fn free(&self, addr: VirtAddr);

    /// Translates a virtual address to the physical address the DSP sees. Returns `None` if
    /// `addr` is not backed by memory this manager knows about.
    fn virt_to_phys(&self, addr: VirtAddr) -> Option<PhysAddr>;

    /// Copies `data` into the mapping at `addr`.
    fn write(&self, addr: VirtAddr, data: &[u8]) -> anyhow::Result<()>;

    /// Fills `buf` from the mapping at `addr`.
    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// Memory backing a buffer exchanged with the pipeline.
pub trait BufferMemory {
    /// Virtual address of the first byte.
    fn vaddr(&self) -> VirtAddr;

    /// Size of the buffer in bytes.
    fn len(&self) -> usize;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("cannot allocate {size} bytes of linear memory")]
    Linear { size: u32 },
    #[error("cannot allocate a {width}x{height} tiled frame")]
    Tiled { width: u32, height: u32 },
    #[error("cannot allocate {size} bytes from the shared heap for {what}")]
    SharedHeap { what: &'static str, size: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferLayout {
    Linear,
    /// NV12 frame: an 8-bit luma plane followed by a 16-bit interleaved chroma plane.
    Tiled { width: u32, height: u32 },
}

/// A region obtained from the platform allocator. Freed on drop.
pub struct PhysicalBuffer {
    addr: VirtAddr,
    len: usize,
    layout: BufferLayout,
    mm: Rc<dyn MemoryManager>,
}

impl PhysicalBuffer {
    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Physical address of the first byte.
    pub fn phys(&self) -> Option<PhysAddr> {
        self.mm.virt_to_phys(self.addr)
    }

    /// Copies `data` at the start of the buffer.
    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > self.len {
            anyhow::bail!(
                "{} bytes do not fit in a {} bytes buffer",
                data.len(),
                self.len
            );
        }

        self.mm.write(self.addr, data)
    }
}

impl BufferMemory for PhysicalBuffer {
    fn vaddr(&self) -> VirtAddr {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PhysicalBuffer")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Drop for PhysicalBuffer {
    fn drop(&mut self) {
        self.mm.free(self.addr);
    }
}

/// Byte size of a tiled NV12 frame of `height` lines, whatever its width. `None` if it does not
/// fit in 32 bits.
pub fn tiled_frame_size(height: u32) -> Option<u32> {
    let lines = u64::from(height).next_multiple_of(2);
    u32::try_from(u64::from(TILER_STRIDE) * lines * 3 / 2).ok()
}

fn page_size() -> u32 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u32,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Allocates DSP-addressable buffers from a [`MemoryManager`].
#[derive(Clone)]
pub struct TilerAllocator {
    mm: Rc<dyn MemoryManager>,
    page_size: u32,
}

impl TilerAllocator {
    pub fn new(mm: Rc<dyn MemoryManager>) -> Self {
        Self {
            mm,
            page_size: page_size(),
        }
    }

    pub fn memory_manager(&self) -> &Rc<dyn MemoryManager> {
        &self.mm
    }

    /// Allocates a page-aligned 1-D region of at least `size` bytes.
    pub fn allocate_linear(&self, size: u32) -> Result<PhysicalBuffer, AllocationError> {
        let len = size
            .max(1)
            .checked_next_multiple_of(self.page_size)
            .ok_or(AllocationError::Linear { size })?;
        let block = AllocBlock {
            pixel_format: PixelFormat::Page,
            dim: BlockDim::Length(len),
            stride: 0,
        };

        let addr = self
            .mm
            .alloc(&[block])
            .ok_or(AllocationError::Linear { size })?;

        log::debug!("allocated {} bytes of linear memory at {:?}", len, addr);

        Ok(PhysicalBuffer {
            addr,
            len: len as usize,
            layout: BufferLayout::Linear,
            mm: Rc::clone(&self.mm),
        })
    }

    /// Allocates a tiled NV12 frame of `width`x`height` pixels. Odd heights are rounded up so the
    /// chroma plane covers every line. Returns the buffer along with its total byte size.
    pub fn allocate_tiled(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(PhysicalBuffer, u32), AllocationError> {
        let size = tiled_frame_size(height).ok_or(AllocationError::Tiled { width, height })?;
        let height = align_up(height, 2);
        let blocks = [
            AllocBlock {
                pixel_format: PixelFormat::Bit8,
                dim: BlockDim::Area { width, height },
                stride: TILER_STRIDE,
            },
            AllocBlock {
                pixel_format: PixelFormat::Bit16,
                dim: BlockDim::Area {
                    width,
                    height: height / 2,
                },
                stride: TILER_STRIDE,
            },
        ];

        let addr = self
            .mm
            .alloc(&blocks)
            .ok_or(AllocationError::Tiled { width, height })?;

        Ok((
            PhysicalBuffer {
                addr,
                len: size as usize,
                layout: BufferLayout::Tiled { width, height },
                mm: Rc::clone(&self.mm),
            },
            size,
        ))
    }

    pub fn virt_to_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.mm.virt_to_phys(addr)
    }
}
