// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lending downstream buffers to the codec.
//!
//! The codec refers to output buffers by a non-zero 32-bit identifier: it receives one with each
//! process call and later lists it as ready for display, then as free. [`BufferBridge`] keeps a
//! handle table from those identifiers to the buffers. Each registration holds a reference to its
//! buffer until the codec reports it free, so the buffer cannot be recycled while the hardware may
//! still write to it.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroI32;
use std::rc::Rc;

use anyhow::anyhow;
use log::debug;
use log::info;

use crate::decoder::geometry::Geometry;
use crate::decoder::DecodedFrame;
use crate::decoder::Error;
use crate::decoder::FrameMeta;
use crate::decoder::Plane;
use crate::decoder::Result;
use crate::decoder::UnsupportedReason;
use crate::decoder::VideoBuffer;
use crate::memory::classify_region;
use crate::memory::MemoryKind;
use crate::memory::PhysAddr;
use crate::memory::TilerAllocator;
use crate::memory::VirtAddr;

/// Identifier of a buffer lent to the codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(NonZeroI32);

impl BufferId {
    pub fn new(id: i32) -> Option<Self> {
        NonZeroI32::new(id).map(Self)
    }

    pub fn get(self) -> i32 {
        self.0.get()
    }

    fn from_slot(slot: usize) -> Option<Self> {
        i32::try_from(slot + 1).ok().and_then(Self::new)
    }

    fn slot(self) -> Option<usize> {
        // Identifiers are never zero, so positive ones are at least 1.
        usize::try_from(self.get()).ok().map(|id| id - 1)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Memory kinds and tiled dimensions of the output buffers given to a codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputShape {
    pub luma_kind: MemoryKind,
    pub chroma_kind: MemoryKind,
    pub width: u32,
    pub height: u32,
}

/// A registered buffer, ready to be described to the codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PreparedOutput {
    pub id: BufferId,
    pub luma: PhysAddr,
    pub chroma: PhysAddr,
    pub shape: OutputShape,
}

struct Registration {
    buffer: Rc<VideoBuffer>,
    luma: PhysAddr,
    meta: FrameMeta,
}

#[derive(Default)]
pub struct BufferBridge {
    /// Registrations indexed by identifier minus one.
    slots: Vec<Option<Registration>>,
    by_luma: HashMap<PhysAddr, BufferId>,
    /// Fixed by the first registration.
    shape: Option<OutputShape>,
}

fn translate(
    allocator: &TilerAllocator,
    plane: Plane,
    addr: VirtAddr,
) -> Result<(PhysAddr, MemoryKind)> {
    let phys = allocator
        .virt_to_phys(addr)
        .ok_or(Error::UnsupportedOutputBuffer(UnsupportedReason::NotMapped {
            plane,
            addr,
        }))?;
    let kind = classify_region(phys).ok_or(Error::UnsupportedOutputBuffer(
        UnsupportedReason::UnknownRegion { plane, addr: phys },
    ))?;
    Ok((phys, kind))
}

impl BufferBridge {
    pub fn new() -> Self {
        Default::default()
    }

    /// Output shape of the session, once a buffer has been registered.
    pub fn shape(&self) -> Option<OutputShape> {
        self.shape
    }

    /// Number of buffers currently lent to the codec.
    pub fn len(&self) -> usize {
        self.by_luma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_luma.is_empty()
    }

    fn registration(&self, id: i32) -> Option<&Registration> {
        let slot = BufferId::new(id)?.slot()?;
        self.slots.get(slot)?.as_ref()
    }

    /// Registers `buffer` and returns the addresses of its planes along with its identifier.
    /// `meta` is attached to the frame when the codec outputs it.
    ///
    /// Both planes must lie in memory the codec can address, and in the same kinds of memory as
    /// the first registered buffer.
    pub fn register_output(
        &mut self,
        buffer: VideoBuffer,
        meta: FrameMeta,
        geometry: &Geometry,
        allocator: &TilerAllocator,
    ) -> Result<PreparedOutput> {
        if buffer.len() < geometry.outsize as usize {
            return Err(Error::UnsupportedOutputBuffer(UnsupportedReason::TooSmall {
                len: buffer.len(),
                needed: geometry.outsize,
            }));
        }

        let luma_vaddr = buffer.vaddr();
        let chroma_vaddr = luma_vaddr.offset(geometry.chroma_offset());
        let (luma, luma_kind) = translate(allocator, Plane::Luma, luma_vaddr)?;
        let (chroma, chroma_kind) = translate(allocator, Plane::Chroma, chroma_vaddr)?;

        if self.by_luma.contains_key(&luma) {
            return Err(Error::UnsupportedOutputBuffer(
                UnsupportedReason::AlreadyRegistered(luma),
            ));
        }

        let shape = match self.shape {
            None => {
                let shape = OutputShape {
                    luma_kind,
                    chroma_kind,
                    width: geometry.padded_width,
                    height: geometry.padded_height,
                };
                info!("output buffers: {:?}", shape);
                self.shape = Some(shape);
                shape
            }
            Some(shape) => {
                for (plane, expected, found) in [
                    (Plane::Luma, shape.luma_kind, luma_kind),
                    (Plane::Chroma, shape.chroma_kind, chroma_kind),
                ] {
                    if expected != found {
                        return Err(Error::UnsupportedOutputBuffer(
                            UnsupportedReason::KindMismatch {
                                plane,
                                expected,
                                found,
                            },
                        ));
                    }
                }
                shape
            }
        };

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = BufferId::from_slot(slot).ok_or_else(|| anyhow!("buffer table is full"))?;

        self.slots[slot] = Some(Registration {
            buffer: Rc::new(buffer),
            luma,
            meta,
        });
        self.by_luma.insert(luma, id);
        debug!("lent buffer {} at {}", id, luma);

        Ok(PreparedOutput {
            id,
            luma,
            chroma,
            shape,
        })
    }

    /// Returns a new reference to the buffer registered as `id`, with the timing of the access
    /// unit it was registered for.
    pub fn resolve(&self, id: i32) -> Result<DecodedFrame> {
        let registration = self
            .registration(id)
            .ok_or(Error::UnknownIdentifier(id))?;

        Ok(DecodedFrame {
            buffer: Rc::clone(&registration.buffer),
            meta: registration.meta,
        })
    }

    /// Drops the registration of `id`. The buffer is recycled once every frame referencing it is
    /// dropped as well.
    pub fn release(&mut self, id: i32) -> Result<()> {
        let registration = BufferId::new(id)
            .and_then(BufferId::slot)
            .and_then(|slot| self.slots.get_mut(slot))
            .and_then(Option::take)
            .ok_or(Error::UnknownIdentifier(id))?;

        self.by_luma.remove(&registration.luma);
        debug!("buffer {} released by the codec", id);

        Ok(())
    }

    /// Drops every registration and forgets the output shape.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_luma.clear();
        self.shape = None;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::codec::h264::H264;
    use crate::codec::vp6::Vp6;
    use crate::codec::CodecVariant;
    use crate::decoder::geometry::negotiate;
    use crate::decoder::StreamCaps;
    use crate::frame_pool::TiledBufferPool;
    use crate::memory::simulated::SimulatedMemory;
    use crate::memory::AllocBlock;
    use crate::memory::BlockDim;
    use crate::memory::BufferMemory;
    use crate::memory::MemoryManager;
    use crate::memory::PixelFormat;
    use crate::Fraction;

    struct Fixture {
        memory: Rc<SimulatedMemory>,
        allocator: TilerAllocator,
        pool: Rc<std::cell::RefCell<TiledBufferPool>>,
        geometry: Geometry,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_stream(&H264, 320, 240)
        }

        fn with_stream(variant: &dyn CodecVariant, width: i32, height: i32) -> Self {
            let memory = SimulatedMemory::new();
            let allocator = TilerAllocator::new(memory.clone());
            let geometry =
                negotiate(&StreamCaps::new(width, height, Fraction::new(30, 1)), variant).unwrap();
            let pool = TiledBufferPool::new(allocator.clone(), 0);
            pool.borrow_mut().configure(&geometry.requirements()).unwrap();

            Self {
                memory,
                allocator,
                pool,
                geometry,
            }
        }

        fn buffer(&self) -> VideoBuffer {
            TiledBufferPool::acquire(&self.pool).unwrap()
        }

        fn register(
            &self,
            bridge: &mut BufferBridge,
            buffer: VideoBuffer,
        ) -> Result<PreparedOutput> {
            bridge.register_output(buffer, FrameMeta::default(), &self.geometry, &self.allocator)
        }
    }

    /// Buffer whose memory is a single 32-bit tiled block.
    struct Tiled32Buffer {
        addr: VirtAddr,
        len: usize,
    }

    impl BufferMemory for Tiled32Buffer {
        fn vaddr(&self) -> VirtAddr {
            self.addr
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    fn tiled32(memory: &SimulatedMemory, len: usize) -> VideoBuffer {
        let block = AllocBlock {
            pixel_format: PixelFormat::Bit32,
            dim: BlockDim::Area {
                width: 1024,
                height: (len / 4096) as u32,
            },
            stride: 4096,
        };
        let addr = memory.alloc(&[block]).unwrap();
        VideoBuffer::new(Box::new(Tiled32Buffer { addr, len }))
    }

    #[test]
    fn odd_heights_keep_chroma_in_its_region() {
        let fixture = Fixture::with_stream(&Vp6, 176, 145);
        let mut bridge = BufferBridge::new();

        let prepared = fixture.register(&mut bridge, fixture.buffer()).unwrap();
        assert_eq!(prepared.shape.luma_kind, MemoryKind::Tiled8);
        assert_eq!(prepared.shape.chroma_kind, MemoryKind::Tiled16);
        assert_eq!(prepared.shape.height, 145);
        assert_eq!(classify_region(prepared.chroma), Some(MemoryKind::Tiled16));
    }

    #[test]
    fn registered_buffers_resolve_to_themselves() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();

        let buffer = fixture.buffer();
        let vaddr = buffer.vaddr();
        let meta = FrameMeta {
            timestamp: Some(40),
            duration: Some(33),
        };
        let prepared = bridge
            .register_output(buffer, meta, &fixture.geometry, &fixture.allocator)
            .unwrap();

        assert_eq!(prepared.id.get(), 1);
        assert_eq!(classify_region(prepared.luma), Some(MemoryKind::Tiled8));
        assert_eq!(classify_region(prepared.chroma), Some(MemoryKind::Tiled16));
        assert_eq!(
            prepared.shape,
            OutputShape {
                luma_kind: MemoryKind::Tiled8,
                chroma_kind: MemoryKind::Tiled16,
                width: 320,
                height: 240,
            }
        );

        let frame = bridge.resolve(prepared.id.get()).unwrap();
        assert_eq!(frame.buffer.vaddr(), vaddr);
        assert_eq!(frame.meta, meta);
        let again = bridge.resolve(prepared.id.get()).unwrap();
        assert!(Rc::ptr_eq(&frame.buffer, &again.buffer));
        // The bridge and the two frames.
        assert_eq!(Rc::strong_count(&frame.buffer), 3);
    }

    #[test]
    fn release_makes_buffers_reusable() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();
        let free_before = fixture.pool.borrow().num_free_buffers();

        let prepared = fixture.register(&mut bridge, fixture.buffer()).unwrap();
        let frame = bridge.resolve(prepared.id.get()).unwrap();
        bridge.release(prepared.id.get()).unwrap();
        assert!(bridge.is_empty());
        assert_eq!(Rc::strong_count(&frame.buffer), 1);
        assert_eq!(fixture.pool.borrow().num_free_buffers(), free_before - 1);

        drop(frame);
        assert_eq!(fixture.pool.borrow().num_free_buffers(), free_before);

        assert!(matches!(
            bridge.release(prepared.id.get()),
            Err(Error::UnknownIdentifier(1))
        ));
        assert!(matches!(
            bridge.resolve(prepared.id.get()),
            Err(Error::UnknownIdentifier(1))
        ));
    }

    #[test]
    fn unknown_identifiers() {
        let bridge = BufferBridge::new();
        for id in [0, 1, -5, i32::MAX, i32::MIN] {
            assert!(matches!(bridge.resolve(id), Err(Error::UnknownIdentifier(i)) if i == id));
        }
    }

    #[test]
    fn identifiers_are_dense_and_stable() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();

        let a = fixture.register(&mut bridge, fixture.buffer()).unwrap();
        let b = fixture.register(&mut bridge, fixture.buffer()).unwrap();
        assert_eq!((a.id.get(), b.id.get()), (1, 2));
        assert_eq!(bridge.len(), 2);
        let b_vaddr = bridge.resolve(b.id.get()).unwrap().buffer.vaddr();

        bridge.release(a.id.get()).unwrap();
        let c = fixture.register(&mut bridge, fixture.buffer()).unwrap();
        assert_eq!(c.id.get(), 1);
        // The reuse of the first slot leaves b alone.
        assert_eq!(bridge.resolve(b.id.get()).unwrap().buffer.vaddr(), b_vaddr);
        assert_ne!(c.luma, b.luma);
    }

    #[test]
    fn foreign_buffer_fails_immediately() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();

        let foreign = VideoBuffer::new(Box::new(
            fixture
                .memory
                .alloc_system(fixture.geometry.outsize as usize),
        ));
        assert!(matches!(
            fixture.register(&mut bridge, foreign),
            Err(Error::UnsupportedOutputBuffer(
                UnsupportedReason::NotMapped {
                    plane: Plane::Luma,
                    ..
                }
            ))
        ));
        assert_eq!(bridge.shape(), None);
        assert!(bridge.is_empty());
    }

    #[test]
    fn buffer_outside_known_regions() {
        struct Unmapped;

        impl BufferMemory for Unmapped {
            fn vaddr(&self) -> VirtAddr {
                VirtAddr(0x1000)
            }

            fn len(&self) -> usize {
                usize::MAX / 2
            }
        }

        /// Maps everything below 0x6000_0000.
        struct LowMemory;

        impl MemoryManager for LowMemory {
            fn alloc(&self, _blocks: &[AllocBlock]) -> Option<VirtAddr> {
                None
            }

            fn free(&self, _addr: VirtAddr) {}

            fn virt_to_phys(&self, addr: VirtAddr) -> Option<PhysAddr> {
                Some(PhysAddr((addr.0 % 0x6000_0000) as u32))
            }

            fn write(&self, _addr: VirtAddr, _data: &[u8]) -> anyhow::Result<()> {
                Ok(())
            }

            fn read(&self, _addr: VirtAddr, _buf: &mut [u8]) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let fixture = Fixture::new();
        let allocator = TilerAllocator::new(Rc::new(LowMemory));
        let mut bridge = BufferBridge::new();

        let err = bridge
            .register_output(
                VideoBuffer::new(Box::new(Unmapped)),
                FrameMeta::default(),
                &fixture.geometry,
                &allocator,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedOutputBuffer(UnsupportedReason::UnknownRegion {
                plane: Plane::Luma,
                addr: PhysAddr(0x1000)
            })
        ));
        assert_eq!(bridge.shape(), None);
    }

    #[test]
    fn mismatching_memory_kind_is_rejected() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();
        fixture.register(&mut bridge, fixture.buffer()).unwrap();

        let other = tiled32(&fixture.memory, fixture.geometry.outsize as usize);
        assert!(matches!(
            fixture.register(&mut bridge, other),
            Err(Error::UnsupportedOutputBuffer(
                UnsupportedReason::KindMismatch {
                    plane: Plane::Luma,
                    expected: MemoryKind::Tiled8,
                    found: MemoryKind::Tiled32,
                }
            ))
        ));
        assert_eq!(bridge.len(), 1);
    }

    #[test]
    fn small_and_duplicate_buffers() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();

        let small = VideoBuffer::new(Box::new(fixture.memory.alloc_system(16)));
        assert!(matches!(
            fixture.register(&mut bridge, small),
            Err(Error::UnsupportedOutputBuffer(UnsupportedReason::TooSmall { len: 16, .. }))
        ));

        // Two buffers sharing the same memory.
        let first = tiled32(&fixture.memory, fixture.geometry.outsize as usize);
        let alias = VideoBuffer::new(Box::new(Tiled32Buffer {
            addr: first.vaddr(),
            len: first.len(),
        }));
        fixture.register(&mut bridge, first).unwrap();
        assert!(matches!(
            fixture.register(&mut bridge, alias),
            Err(Error::UnsupportedOutputBuffer(
                UnsupportedReason::AlreadyRegistered(_)
            ))
        ));
    }

    #[test]
    fn clear_forgets_the_shape() {
        let fixture = Fixture::new();
        let mut bridge = BufferBridge::new();
        fixture.register(&mut bridge, fixture.buffer()).unwrap();
        assert!(bridge.shape().is_some());

        bridge.clear();
        assert!(bridge.is_empty());
        assert_eq!(bridge.shape(), None);
        assert_eq!(
            fixture.pool.borrow().num_free_buffers(),
            fixture.pool.borrow().num_managed_buffers()
        );
    }
}
