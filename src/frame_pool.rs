// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A pool of tiled NV12 frames, for the downstream side of a decoder.
//!
//! The IVA-HD can only write its output to TILER memory, so whoever allocates the decoder's output
//! buffers needs to get them from the TILER. This pool does that and recycles the buffers: a
//! [`PooledBuffer`] goes back to its pool once dropped, i.e. once both the codec and the pipeline
//! are done with it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::rc::Weak;

use crate::decoder::BufferRequirements;
use crate::decoder::FlowError;
use crate::decoder::VideoBuffer;
use crate::memory::AllocationError;
use crate::memory::BufferLayout;
use crate::memory::BufferMemory;
use crate::memory::PhysicalBuffer;
use crate::memory::TilerAllocator;
use crate::memory::VirtAddr;
use crate::Resolution;

/// A tiled frame obtained from a [`TiledBufferPool`].
///
/// The frame is returned to its pool upon dropping, provided the pool still exists and the frame
/// is still large enough for it.
pub struct PooledBuffer {
    addr: VirtAddr,
    len: usize,
    buffer: Option<PhysicalBuffer>,
    pool: Weak<RefCell<TiledBufferPool>>,
}

impl PooledBuffer {
    fn new(buffer: PhysicalBuffer, pool: &Rc<RefCell<TiledBufferPool>>) -> Self {
        Self {
            addr: buffer.vaddr(),
            len: buffer.len(),
            buffer: Some(buffer),
            pool: Rc::downgrade(pool),
        }
    }
}

impl BufferMemory for PooledBuffer {
    fn vaddr(&self) -> VirtAddr {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Some(pool) = self.pool.upgrade() {
                let mut pool = pool.borrow_mut();
                if pool.managed.contains_key(&self.addr) {
                    pool.free.push_back(buffer);
                    return;
                }
            }

            log::debug!("dropping stale frame at {:?} ({:?})", self.addr, buffer.layout());
        }
    }
}

fn frame_resolution(buffer: &PhysicalBuffer) -> Resolution {
    match buffer.layout() {
        BufferLayout::Tiled { width, height } => Resolution::from((width, height)),
        BufferLayout::Linear => Resolution::default(),
    }
}

/// A pool of tiled frames of a given resolution.
///
/// Frames too small for the current resolution are dropped when the resolution changes, even if
/// they are in use at that moment.
pub struct TiledBufferPool {
    allocator: TilerAllocator,
    resolution: Resolution,
    /// Upper bound on the number of frames the pool allocates.
    max_buffers: usize,
    free: VecDeque<PhysicalBuffer>,
    /// All the frames owned by this pool, in use or not, indexed by address.
    managed: BTreeMap<VirtAddr, Resolution>,
}

impl TiledBufferPool {
    pub fn new(allocator: TilerAllocator, max_buffers: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            allocator,
            resolution: Default::default(),
            max_buffers,
            free: Default::default(),
            managed: Default::default(),
        }))
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Sets the resolution of the frames. Releases the frames that became too small.
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
        self.managed.retain(|_, res| res.can_contain(resolution));
        self.free
            .retain(|b| frame_resolution(b).can_contain(resolution));
    }

    /// Allocates `count` new frames of the current resolution.
    pub fn add_buffers(&mut self, count: usize) -> Result<(), AllocationError> {
        for _ in 0..count {
            let (buffer, _) = self
                .allocator
                .allocate_tiled(self.resolution.width, self.resolution.height)?;
            self.managed.insert(buffer.vaddr(), frame_resolution(&buffer));
            self.free.push_back(buffer);
        }

        Ok(())
    }

    /// Sizes the pool according to a decoder's requirements and pre-allocates its frames.
    pub fn configure(&mut self, requirements: &BufferRequirements) -> Result<(), AllocationError> {
        self.set_resolution(Resolution::from((
            requirements.min_width,
            requirements.min_height,
        )));
        self.max_buffers = self.max_buffers.max(requirements.min_buffers as usize);

        let missing = (requirements.min_buffers as usize).saturating_sub(self.managed.len());
        log::debug!(
            "pre-allocating {} frames of {}x{}",
            missing,
            self.resolution.width,
            self.resolution.height
        );
        self.add_buffers(missing)
    }

    /// Gets a free frame, allocating a new one if none is free and the pool can grow.
    ///
    /// `return_pool` is the smart pointer containing the pool, which frames go back to.
    pub fn get_buffer(&mut self, return_pool: &Rc<RefCell<Self>>) -> Option<PooledBuffer> {
        if self.free.is_empty() && self.managed.len() < self.max_buffers {
            if let Err(e) = self.add_buffers(1) {
                log::warn!("cannot grow frame pool: {}", e);
            }
        }

        let buffer = self.free.pop_front()?;
        debug_assert!(frame_resolution(&buffer).can_contain(self.resolution));
        Some(PooledBuffer::new(buffer, return_pool))
    }

    /// Gets a free frame from `pool` as a [`VideoBuffer`].
    pub fn acquire(pool: &Rc<RefCell<Self>>) -> Result<VideoBuffer, FlowError> {
        let buffer = pool.borrow_mut().get_buffer(pool).ok_or_else(|| {
            log::warn!("frame pool exhausted");
            FlowError::Error
        })?;
        Ok(VideoBuffer::new(Box::new(buffer)))
    }

    pub fn num_free_buffers(&self) -> usize {
        self.free.len()
    }

    pub fn num_managed_buffers(&self) -> usize {
        self.managed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::simulated::SimulatedMemory;

    fn requirements(min_buffers: u32) -> BufferRequirements {
        BufferRequirements {
            min_buffers,
            min_width: 320,
            min_height: 240,
        }
    }

    #[test]
    fn buffers_return_to_the_pool() {
        let mm = SimulatedMemory::new();
        let pool = TiledBufferPool::new(TilerAllocator::new(mm.clone()), 0);
        pool.borrow_mut().configure(&requirements(2)).unwrap();
        assert_eq!(pool.borrow().num_free_buffers(), 2);

        let a = TiledBufferPool::acquire(&pool).unwrap();
        let b = TiledBufferPool::acquire(&pool).unwrap();
        assert_ne!(a.vaddr(), b.vaddr());
        assert_eq!(TiledBufferPool::acquire(&pool).unwrap_err(), FlowError::Error);

        let addr = a.vaddr();
        drop(a);
        assert_eq!(pool.borrow().num_free_buffers(), 1);
        let c = TiledBufferPool::acquire(&pool).unwrap();
        assert_eq!(c.vaddr(), addr);

        drop(b);
        drop(c);
        assert_eq!(mm.live_allocations(), 2);
        drop(pool);
        assert_eq!(mm.live_allocations(), 0);
    }

    #[test]
    fn pool_grows_up_to_its_limit() {
        let mm = SimulatedMemory::new();
        let pool = TiledBufferPool::new(TilerAllocator::new(mm), 3);
        pool.borrow_mut().set_resolution(Resolution::from((64, 64)));

        let frames: Vec<_> = (0..3)
            .map(|_| TiledBufferPool::acquire(&pool).unwrap())
            .collect();
        assert!(TiledBufferPool::acquire(&pool).is_err());
        assert_eq!(pool.borrow().num_managed_buffers(), 3);
        assert!(frames.iter().all(|f| f.len() >= 4096 * 64 * 3 / 2));
    }

    #[test]
    fn resolution_change_drops_small_frames() {
        let mm = SimulatedMemory::new();
        let pool = TiledBufferPool::new(TilerAllocator::new(mm.clone()), 0);
        pool.borrow_mut().configure(&requirements(2)).unwrap();

        let in_use = TiledBufferPool::acquire(&pool).unwrap();
        pool.borrow_mut().set_resolution(Resolution::from((640, 480)));
        assert_eq!(pool.borrow().num_managed_buffers(), 0);
        assert_eq!(mm.live_allocations(), 1);

        // The frame in use is not returned to the pool.
        drop(in_use);
        assert_eq!(pool.borrow().num_free_buffers(), 0);
        assert_eq!(mm.live_allocations(), 0);
    }
}
