// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A software memory manager that hands out heap memory while pretending it lives in the TILER
//! container, so the decoder can run without the platform allocator.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;

use crate::memory::AllocBlock;
use crate::memory::BufferMemory;
use crate::memory::MemoryManager;
use crate::memory::PhysAddr;
use crate::memory::PixelFormat;
use crate::memory::VirtAddr;

const VIRT_BASE: usize = 0x4000_0000;
const GUARD: usize = 0x1000;

const TILED8_BASE: u32 = 0x6000_0000;
const TILED16_BASE: u32 = 0x6800_0000;
const TILED32_BASE: u32 = 0x7000_0000;
const RAW_BASE: u32 = 0x7800_0000;
const REGION_SIZE: u32 = 0x0800_0000;

/// A contiguous part of an allocation backed by one physical window.
struct Segment {
    offset: usize,
    len: usize,
    phys: Option<u32>,
}

struct Allocation {
    data: Vec<u8>,
    segments: Vec<Segment>,
}

impl Allocation {
    fn phys_of(&self, offset: usize) -> Option<PhysAddr> {
        self.segments
            .iter()
            .find(|s| offset >= s.offset && offset < s.offset + s.len)
            .and_then(|s| s.phys.map(|p| PhysAddr(p + (offset - s.offset) as u32)))
    }
}

struct Inner {
    next_virt: usize,
    /// Next free physical address in the Tiled8, Tiled16, Tiled32 and Raw windows.
    next_phys: [u32; 4],
    allocations: BTreeMap<usize, Allocation>,
    /// Remaining bytes the allocator may hand out, or `None` for no limit.
    budget: Option<usize>,
    num_allocs: usize,
    num_frees: usize,
}

impl Inner {
    fn find(&self, addr: VirtAddr) -> Option<(usize, &Allocation)> {
        let (start, allocation) = self.allocations.range(..=addr.0).next_back()?;
        let offset = addr.0 - start;
        (offset < allocation.data.len()).then_some((offset, allocation))
    }

    fn find_mut(&mut self, addr: VirtAddr) -> Option<(usize, &mut Allocation)> {
        let (start, allocation) = self.allocations.range_mut(..=addr.0).next_back()?;
        let offset = addr.0 - start;
        (offset < allocation.data.len()).then_some((offset, allocation))
    }

    fn find_phys_mut(&mut self, addr: PhysAddr) -> Option<(usize, &mut Allocation)> {
        self.allocations.values_mut().find_map(|allocation| {
            let offset = allocation.segments.iter().find_map(|s| {
                let delta = addr.0.checked_sub(s.phys?)? as usize;
                (delta < s.len).then(|| s.offset + delta)
            })?;
            Some((offset, allocation))
        })
    }

    fn insert(&mut self, segments: Vec<Segment>, len: usize) -> VirtAddr {
        let addr = self.next_virt;
        self.next_virt += (len + GUARD).next_multiple_of(GUARD);
        self.allocations.insert(
            addr,
            Allocation {
                data: vec![0; len],
                segments,
            },
        );
        self.num_allocs += 1;
        VirtAddr(addr)
    }
}

/// Software replacement for the TILER memory manager.
pub struct SimulatedMemory {
    inner: RefCell<Inner>,
}

impl SimulatedMemory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                next_virt: VIRT_BASE,
                next_phys: [TILED8_BASE, TILED16_BASE, TILED32_BASE, RAW_BASE],
                allocations: Default::default(),
                budget: None,
                num_allocs: 0,
                num_frees: 0,
            }),
        })
    }

    /// Limits the number of bytes that can still be allocated. `None` removes the limit.
    pub fn set_budget(&self, budget: Option<usize>) {
        self.inner.borrow_mut().budget = budget;
    }

    /// Number of allocations not freed yet.
    pub fn live_allocations(&self) -> usize {
        self.inner.borrow().allocations.len()
    }

    pub fn num_allocs(&self) -> usize {
        self.inner.borrow().num_allocs
    }

    pub fn num_frees(&self) -> usize {
        self.inner.borrow().num_frees
    }

    /// Allocates `len` bytes of ordinary system memory, which has no physical address the DSP
    /// could use. Useful to emulate buffers coming from a foreign allocator.
    pub fn alloc_system(self: &Rc<Self>, len: usize) -> SystemBuffer {
        let addr = self.inner.borrow_mut().insert(
            vec![Segment {
                offset: 0,
                len,
                phys: None,
            }],
            len,
        );

        SystemBuffer {
            addr,
            len,
            mm: Rc::clone(self),
        }
    }

    /// Copies `data` to the physical address `addr`, as a DMA engine would.
    pub fn write_phys(&self, addr: PhysAddr, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let (offset, allocation) = inner
            .find_phys_mut(addr)
            .ok_or_else(|| anyhow!("no memory at physical address {}", addr))?;
        let dst = allocation
            .data
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow!("write at {} overflows its allocation", addr))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Reads `buf.len()` bytes from the physical address `addr`.
    pub fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let (offset, allocation) = inner
            .find_phys_mut(addr)
            .ok_or_else(|| anyhow!("no memory at physical address {}", addr))?;
        let src = allocation
            .data
            .get(offset..offset + buf.len())
            .ok_or_else(|| anyhow!("read at {} overflows its allocation", addr))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl MemoryManager for SimulatedMemory {
    fn alloc(&self, blocks: &[AllocBlock]) -> Option<VirtAddr> {
        let mut inner = self.inner.borrow_mut();
        let total: usize = blocks.iter().map(AllocBlock::mapped_size).sum();

        if let Some(budget) = inner.budget {
            if total > budget {
                log::debug!("simulated memory exhausted: {} > {} bytes", total, budget);
                return None;
            }
        }

        let mut segments = Vec::with_capacity(blocks.len());
        let mut next_phys = inner.next_phys;
        let mut offset = 0;
        for block in blocks {
            let len = block.mapped_size();
            let window = match block.pixel_format {
                PixelFormat::Bit8 => 0,
                PixelFormat::Bit16 => 1,
                PixelFormat::Bit32 => 2,
                PixelFormat::Page => 3,
            };
            let base = [TILED8_BASE, TILED16_BASE, TILED32_BASE, RAW_BASE][window];
            let phys = next_phys[window];
            if (phys - base) as usize + len > REGION_SIZE as usize {
                return None;
            }
            next_phys[window] = phys + (len as u32).next_multiple_of(GUARD as u32);

            segments.push(Segment {
                offset,
                len,
                phys: Some(phys),
            });
            offset += len;
        }

        inner.next_phys = next_phys;
        if let Some(budget) = inner.budget.as_mut() {
            *budget -= total;
        }

        Some(inner.insert(segments, total))
    }

    fn free(&self, addr: VirtAddr) {
        let mut inner = self.inner.borrow_mut();
        match inner.allocations.remove(&addr.0) {
            Some(allocation) => {
                inner.num_frees += 1;
                if let Some(budget) = inner.budget.as_mut() {
                    *budget += allocation.data.len();
                }
            }
            None => log::warn!("freeing unknown allocation {:?}", addr),
        }
    }

    fn virt_to_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let inner = self.inner.borrow();
        let (offset, allocation) = inner.find(addr)?;
        allocation.phys_of(offset)
    }

    fn write(&self, addr: VirtAddr, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let (offset, allocation) = inner
            .find_mut(addr)
            .ok_or_else(|| anyhow!("no memory mapped at {:?}", addr))?;
        let dst = allocation
            .data
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow!("write at {:?} overflows its allocation", addr))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> anyhow::Result<()> {
        let inner = self.inner.borrow();
        let (offset, allocation) = inner
            .find(addr)
            .ok_or_else(|| anyhow!("no memory mapped at {:?}", addr))?;
        let src = allocation
            .data
            .get(offset..offset + buf.len())
            .ok_or_else(|| anyhow!("read at {:?} overflows its allocation", addr))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// System memory buffer obtained from [`SimulatedMemory::alloc_system`]. Freed on drop.
pub struct SystemBuffer {
    addr: VirtAddr,
    len: usize,
    mm: Rc<SimulatedMemory>,
}

impl BufferMemory for SystemBuffer {
    fn vaddr(&self) -> VirtAddr {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SystemBuffer {
    fn drop(&mut self) {
        self.mm.free(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BlockDim;

    #[test]
    fn translation_follows_blocks() {
        let mm = SimulatedMemory::new();
        let blocks = [
            AllocBlock {
                pixel_format: PixelFormat::Bit8,
                dim: BlockDim::Area {
                    width: 64,
                    height: 4,
                },
                stride: 4096,
            },
            AllocBlock {
                pixel_format: PixelFormat::Bit16,
                dim: BlockDim::Area {
                    width: 64,
                    height: 2,
                },
                stride: 4096,
            },
        ];
        let addr = mm.alloc(&blocks).unwrap();

        assert_eq!(mm.virt_to_phys(addr), Some(PhysAddr(TILED8_BASE)));
        assert_eq!(
            mm.virt_to_phys(addr.offset(4096 * 4)),
            Some(PhysAddr(TILED16_BASE))
        );
        assert_eq!(mm.virt_to_phys(addr.offset(4096 * 6)), None);

        mm.write_phys(PhysAddr(TILED16_BASE + 1), &[7]).unwrap();
        let mut byte = [0];
        mm.read(addr.offset(4096 * 4 + 1), &mut byte).unwrap();
        assert_eq!(byte, [7]);

        mm.free(addr);
        assert_eq!(mm.virt_to_phys(addr), None);
        assert_eq!(mm.num_frees(), 1);
    }

    #[test]
    fn physical_lookup_skips_higher_windows() {
        let mm = SimulatedMemory::new();
        let raw = mm
            .alloc(&[AllocBlock {
                pixel_format: PixelFormat::Page,
                dim: BlockDim::Length(4096),
                stride: 0,
            }])
            .unwrap();
        let tiled = mm
            .alloc(&[AllocBlock {
                pixel_format: PixelFormat::Bit8,
                dim: BlockDim::Area {
                    width: 64,
                    height: 2,
                },
                stride: 4096,
            }])
            .unwrap();

        // The raw window sits above the tiled one and is walked first.
        mm.write_phys(PhysAddr(TILED8_BASE + 3), &[9]).unwrap();
        let mut byte = [0];
        mm.read(tiled.offset(3), &mut byte).unwrap();
        assert_eq!(byte, [9]);

        mm.write_phys(PhysAddr(RAW_BASE), &[5]).unwrap();
        mm.read_phys(PhysAddr(RAW_BASE), &mut byte).unwrap();
        assert_eq!(byte, [5]);
        assert_eq!(mm.virt_to_phys(raw), Some(PhysAddr(RAW_BASE)));

        assert!(mm.write_phys(PhysAddr(0x5000_0000), &[1]).is_err());
    }

    #[test]
    fn system_memory_has_no_physical_address() {
        let mm = SimulatedMemory::new();
        let buffer = mm.alloc_system(128);
        assert_eq!(mm.virt_to_phys(buffer.vaddr()), None);
        drop(buffer);
        assert_eq!(mm.live_allocations(), 0);
    }

    #[test]
    fn budget_is_restored_on_free() {
        let mm = SimulatedMemory::new();
        mm.set_budget(Some(8192));
        let block = AllocBlock {
            pixel_format: PixelFormat::Page,
            dim: BlockDim::Length(8192),
            stride: 0,
        };

        let addr = mm.alloc(&[block]).unwrap();
        assert!(mm.alloc(&[block]).is_none());
        mm.free(addr);
        assert!(mm.alloc(&[block]).is_some());
    }
}
