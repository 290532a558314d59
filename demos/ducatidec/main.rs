// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ducatidec, a decoder program driving the Ducati elements over the simulated IVA-HD. Prints the
//! timestamp and a CRC32 of the luma plane of each decoded frame.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;

use ducati_codecs::decoder::element::ElementState;
use ducati_codecs::decoder::AccessUnit;
use ducati_codecs::decoder::BufferRequirements;
use ducati_codecs::decoder::DecodedFrame;
use ducati_codecs::decoder::DecoderOptions;
use ducati_codecs::decoder::Downstream;
use ducati_codecs::decoder::Event;
use ducati_codecs::decoder::FlowError;
use ducati_codecs::decoder::OutputCaps;
use ducati_codecs::decoder::StreamCaps;
use ducati_codecs::decoder::VideoBuffer;
use ducati_codecs::engine::simulated::SimulatedEngine;
use ducati_codecs::frame_pool::TiledBufferPool;
use ducati_codecs::memory::simulated::SimulatedMemory;
use ducati_codecs::memory::MemoryManager;
use ducati_codecs::memory::TilerAllocator;
use ducati_codecs::plugin;
use ducati_codecs::utils::IvfIterator;

use crate::util::Args;
use crate::util::EncodedFormat;

mod util;

/// Sink allocating tiled frames from a pool and checksumming what it receives.
struct ChecksumSink {
    memory: Rc<SimulatedMemory>,
    pool: Rc<RefCell<TiledBufferPool>>,
    caps: Option<OutputCaps>,
    num_frames: usize,
}

impl ChecksumSink {
    fn new(memory: Rc<SimulatedMemory>) -> Self {
        let pool = TiledBufferPool::new(TilerAllocator::new(memory.clone()), 0);
        Self {
            memory,
            pool,
            caps: None,
            num_frames: 0,
        }
    }

    fn configure(&mut self, requirements: &BufferRequirements) -> anyhow::Result<()> {
        self.pool.borrow_mut().configure(requirements)?;
        Ok(())
    }

    fn luma_crc(&self, frame: &DecodedFrame) -> anyhow::Result<u32> {
        let caps = self.caps.ok_or_else(|| anyhow!("frame received before caps"))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut row = vec![0u8; caps.width as usize];
        for y in 0..caps.height as usize {
            let addr = frame.buffer.vaddr().offset(y * caps.rowstride as usize);
            self.memory.read(addr, &mut row)?;
            hasher.update(&row);
        }
        Ok(hasher.finalize())
    }
}

impl Downstream for ChecksumSink {
    fn set_caps(&mut self, caps: &OutputCaps) -> bool {
        println!("caps: {}", caps);
        self.caps = Some(*caps);
        true
    }

    fn alloc_buffer(&mut self, _size: u32, _caps: &OutputCaps) -> Result<VideoBuffer, FlowError> {
        TiledBufferPool::acquire(&self.pool)
    }

    fn push(&mut self, frame: DecodedFrame) -> Result<(), FlowError> {
        let crc = self.luma_crc(&frame).map_err(|e| {
            log::error!("cannot read frame: {:#}", e);
            FlowError::Error
        })?;
        let timestamp = frame
            .meta
            .timestamp
            .map_or_else(|| "none".to_string(), |t| t.to_string());
        println!("frame {:4}: pts {} crc32 {:08x}", self.num_frames, timestamp, crc);
        self.num_frames += 1;
        Ok(())
    }

    fn push_event(&mut self, event: Event) -> bool {
        log::debug!("sink got {:?}", event);
        true
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = std::fs::read(&args.input)
        .with_context(|| format!("error reading {}", args.input.display()))?;
    let (header, frames) = IvfIterator::new(&input)?;

    let format = match args.codec {
        Some(format) => format,
        None => EncodedFormat::from_fourcc(&header.fourcc).ok_or_else(|| {
            anyhow!(
                "cannot guess the codec of fourcc {:?}, use --codec",
                String::from_utf8_lossy(&header.fourcc)
            )
        })?,
    };

    let memory = SimulatedMemory::new();
    let engine = SimulatedEngine::new().with_memory(memory.clone());
    if let Some(frame) = args.fail_at {
        engine.fail_process_at(frame, -1, 0x8000);
    }

    let options = DecoderOptions {
        delete_codec: args.delete_codec,
        ..Default::default()
    };
    let element_name = format.element_name();
    let mut element = plugin::make_element(
        element_name,
        &format!("{}0", element_name),
        engine.clone(),
        memory.clone(),
        ChecksumSink::new(memory.clone()),
        options,
    )
    .ok_or_else(|| anyhow!("no element {}", element_name))?;

    element.set_state(ElementState::Playing)?;

    let framerate = header.framerate();
    element.set_sink_caps(&StreamCaps::new(
        header.width.into(),
        header.height.into(),
        framerate,
    ))?;
    let requirements = element
        .query_buffers()
        .ok_or_else(|| anyhow!("element is not negotiated"))?;
    element.downstream_mut().configure(&requirements)?;

    // Time base of the file is timescale / framerate seconds.
    let to_ns = |ts: u64| {
        ts.saturating_mul(1_000_000_000)
            .saturating_mul(header.timescale as u64)
            / (header.framerate as u64).max(1)
    };

    for (frame_header, data) in frames.take(args.frames.unwrap_or(usize::MAX)) {
        let au = AccessUnit::new(data.to_vec(), Some(to_ns(frame_header.timestamp)), None);
        element.decode(&au)?;
    }
    if let Err(e) = element.handle_event(Event::Eos) {
        log::warn!("end of stream: {}", e);
    }

    println!(
        "{} frames decoded, {} process calls",
        element.downstream().num_frames,
        engine.calls().process
    );

    element.set_state(ElementState::Null)?;
    Ok(())
}
