// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A codec engine that runs on the CPU.
//!
//! It does not decode anything: it follows the buffer protocol of the IVA-HD codecs (display
//! delay, reference window, zero-terminated identifier lists) so the orchestration can be
//! exercised without the DSP. Failures of every engine call can be injected, and all calls are
//! counted so tests can check which ones reached the "hardware".

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::engine::BufDesc;
use crate::engine::CodecEngine;
use crate::engine::ControlCommand;
use crate::engine::DecoderStatus;
use crate::engine::DynamicParams;
use crate::engine::EngineStatus;
use crate::engine::InArgs;
use crate::engine::OutArgs;
use crate::engine::SharedAddr;
use crate::engine::VideoDecoderParams;
use crate::engine::MAX_IO_BUFFERS;
use crate::memory::simulated::SimulatedMemory;

/// Extended error reported when a process call gets malformed arguments. Bit 15 flags errors
/// the codec cannot recover from.
pub const EXTENDED_ERROR_BAD_ARGS: u32 = 0x8000;

/// Number of times each engine entry point has been called.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open: usize,
    pub close: usize,
    pub create: usize,
    pub control: usize,
    pub process: usize,
    pub delete: usize,
}

#[derive(Copy, Clone, Debug)]
struct InjectedFailure {
    frame: usize,
    status: i32,
    extended_error: u32,
}

#[derive(Default)]
struct Inner {
    fail_open: bool,
    fail_create: bool,
    control_status: i32,
    shared_heap_limit: Option<usize>,
    process_failure: Option<InjectedFailure>,
    display_delay: usize,
    reference_frames: usize,
    memory: Option<Rc<SimulatedMemory>>,

    calls: CallCounts,
    open_sessions: usize,
    next_shared: usize,
    shared_blocks: BTreeMap<usize, u32>,
    last_params: Option<VideoDecoderParams>,
    last_codec_name: Option<String>,
    last_dyn_params: Option<DynamicParams>,
    next_codec: u32,
}

/// Session handle of [`SimulatedEngine`].
#[derive(Debug)]
pub struct SimulatedSession {
    name: String,
}

impl SimulatedSession {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Codec handle of [`SimulatedEngine`].
#[derive(Debug)]
pub struct SimulatedCodec {
    id: u32,
    name: String,
    frames: usize,
    /// Decoded buffers waiting to be displayed.
    pending_display: VecDeque<i32>,
    /// Decoded buffers, in decode order, that the codec still holds.
    held: VecDeque<i32>,
    displayed: Vec<i32>,
}

impl SimulatedCodec {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A software [`CodecEngine`]. Clones share the same state, so a test can keep one to inspect
/// the engine while the decoder owns another.
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    inner: Rc<RefCell<Inner>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes the decoded frames visible in `memory`: the first bytes of each output luma plane
    /// receive the CRC32 of the input access unit followed by the frame index.
    pub fn with_memory(self, memory: Rc<SimulatedMemory>) -> Self {
        self.inner.borrow_mut().memory = Some(memory);
        self
    }

    pub fn fail_open(&self, fail: bool) {
        self.inner.borrow_mut().fail_open = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.borrow_mut().fail_create = fail;
    }

    /// Status returned by [`ControlCommand::SetParams`].
    pub fn set_control_status(&self, status: i32) {
        self.inner.borrow_mut().control_status = status;
    }

    /// Number of shared heap blocks that can be live at the same time. `None` removes the limit.
    pub fn set_shared_heap_limit(&self, limit: Option<usize>) {
        self.inner.borrow_mut().shared_heap_limit = limit;
    }

    /// Makes the process call of the `frame`-th access unit (counting from 0) of each codec fail.
    pub fn fail_process_at(&self, frame: usize, status: i32, extended_error: u32) {
        self.inner.borrow_mut().process_failure = Some(InjectedFailure {
            frame,
            status,
            extended_error,
        });
    }

    /// Number of frames decoded before the first one is output.
    pub fn set_display_delay(&self, frames: usize) {
        self.inner.borrow_mut().display_delay = frames;
    }

    /// Number of already displayed frames the codec keeps as references.
    pub fn set_reference_frames(&self, frames: usize) {
        self.inner.borrow_mut().reference_frames = frames;
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.borrow().calls
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().open_sessions > 0
    }

    pub fn live_shared_blocks(&self) -> usize {
        self.inner.borrow().shared_blocks.len()
    }

    /// Parameters of the last successful codec creation.
    pub fn last_params(&self) -> Option<VideoDecoderParams> {
        self.inner.borrow().last_params.clone()
    }

    pub fn last_codec_name(&self) -> Option<String> {
        self.inner.borrow().last_codec_name.clone()
    }

    /// Dynamic parameters of the last control call.
    pub fn last_dyn_params(&self) -> Option<DynamicParams> {
        self.inner.borrow().last_dyn_params.clone()
    }
}

fn validate(in_bufs: &BufDesc, out_bufs: &BufDesc, in_args: &InArgs) -> Result<(), &'static str> {
    if in_bufs.num_bufs != 1 {
        return Err("expected one input buffer");
    }
    if in_args.num_bytes == 0 {
        return Err("empty access unit");
    }
    if in_args.input_id == 0 {
        return Err("null input identifier");
    }
    if out_bufs.num_bufs != 2 {
        return Err("expected a two-plane output buffer");
    }
    Ok(())
}

fn write_id_list(list: &mut [i32; MAX_IO_BUFFERS], ids: &[i32]) {
    *list = [0; MAX_IO_BUFFERS];
    // Keep room for the terminator.
    for (slot, id) in list.iter_mut().zip(ids.iter().take(MAX_IO_BUFFERS - 1)) {
        *slot = *id;
    }
}

impl Inner {
    /// Emulates the DMA traffic of a decode: reads the bitstream and stamps the output frame.
    fn touch_memory(
        &self,
        in_bufs: &BufDesc,
        out_bufs: &BufDesc,
        in_args: &InArgs,
        frame: usize,
    ) -> anyhow::Result<()> {
        let memory = match &self.memory {
            Some(memory) => memory,
            None => return Ok(()),
        };

        let mut input = vec![0u8; in_args.num_bytes as usize];
        memory.read_phys(in_bufs.descs[0].buf, &mut input)?;

        let mut stamp = [0u8; 8];
        stamp[..4].copy_from_slice(&crc32fast::hash(&input).to_le_bytes());
        stamp[4..].copy_from_slice(&(frame as u32).to_le_bytes());
        memory.write_phys(out_bufs.descs[0].buf, &stamp)
    }
}

impl CodecEngine for SimulatedEngine {
    type Session = SimulatedSession;
    type Codec = SimulatedCodec;

    fn open(&mut self, name: &str) -> Option<SimulatedSession> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.open += 1;
        if inner.fail_open {
            return None;
        }

        inner.open_sessions += 1;
        Some(SimulatedSession {
            name: name.to_string(),
        })
    }

    fn close(&mut self, _session: SimulatedSession) {
        let mut inner = self.inner.borrow_mut();
        inner.calls.close += 1;
        inner.open_sessions = inner.open_sessions.saturating_sub(1);
    }

    fn alloc_shared(&mut self, size: u32) -> Option<SharedAddr> {
        let mut inner = self.inner.borrow_mut();
        let live = inner.shared_blocks.len();
        if inner.shared_heap_limit.is_some_and(|limit| live >= limit) {
            return None;
        }

        inner.next_shared += 1;
        let addr = inner.next_shared;
        inner.shared_blocks.insert(addr, size);
        Some(SharedAddr(addr))
    }

    fn free_shared(&mut self, addr: SharedAddr) {
        if self.inner.borrow_mut().shared_blocks.remove(&addr.0).is_none() {
            log::warn!("freeing unknown shared block {:?}", addr);
        }
    }

    fn create(
        &mut self,
        _session: &mut SimulatedSession,
        codec_name: &str,
        params: &VideoDecoderParams,
    ) -> Option<SimulatedCodec> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.create += 1;
        if inner.fail_create || params.max_width == 0 || params.max_height == 0 {
            return None;
        }

        inner.next_codec += 1;
        inner.last_params = Some(params.clone());
        inner.last_codec_name = Some(codec_name.to_string());

        Some(SimulatedCodec {
            id: inner.next_codec,
            name: codec_name.to_string(),
            frames: 0,
            pending_display: Default::default(),
            held: Default::default(),
            displayed: Default::default(),
        })
    }

    fn control(
        &mut self,
        _codec: &mut SimulatedCodec,
        cmd: ControlCommand,
        dyn_params: &DynamicParams,
        status: &mut DecoderStatus,
    ) -> i32 {
        let mut inner = self.inner.borrow_mut();
        inner.calls.control += 1;
        inner.last_dyn_params = Some(dyn_params.clone());

        match cmd {
            ControlCommand::SetParams => {
                status.extended_error = 0;
                inner.control_status
            }
            ControlCommand::GetStatus | ControlCommand::GetBufInfo | ControlCommand::SetDefault => {
                EngineStatus::Ok as i32
            }
            ControlCommand::Reset | ControlCommand::Flush => EngineStatus::Unsupported as i32,
        }
    }

    fn process(
        &mut self,
        codec: &mut SimulatedCodec,
        in_bufs: &BufDesc,
        out_bufs: &BufDesc,
        in_args: &InArgs,
        out_args: &mut OutArgs,
    ) -> i32 {
        let mut inner = self.inner.borrow_mut();
        inner.calls.process += 1;

        let frame = codec.frames;
        codec.frames += 1;

        out_args.output_id = [0; MAX_IO_BUFFERS];
        out_args.free_buf_id = [0; MAX_IO_BUFFERS];
        out_args.bytes_consumed = 0;
        out_args.extended_error = 0;

        if let Some(failure) = inner.process_failure.filter(|f| f.frame == frame) {
            out_args.extended_error = failure.extended_error;
            return failure.status;
        }

        if let Err(e) = validate(in_bufs, out_bufs, in_args) {
            log::debug!("codec {} rejected frame {}: {}", codec.name, frame, e);
            out_args.extended_error = EXTENDED_ERROR_BAD_ARGS;
            return EngineStatus::Fail as i32;
        }

        if let Err(e) = inner.touch_memory(in_bufs, out_bufs, in_args, frame) {
            log::debug!("codec {} cannot access frame {}: {:#}", codec.name, frame, e);
            out_args.extended_error = EXTENDED_ERROR_BAD_ARGS;
            return EngineStatus::Fail as i32;
        }

        codec.pending_display.push_back(in_args.input_id);
        codec.held.push_back(in_args.input_id);

        let mut outputs = Vec::new();
        while codec.pending_display.len() > inner.display_delay {
            if let Some(id) = codec.pending_display.pop_front() {
                codec.displayed.push(id);
                outputs.push(id);
            }
        }

        // A buffer is released once displayed and out of the reference window.
        let mut freed = Vec::new();
        while codec.held.len() > inner.reference_frames {
            match codec.held.front() {
                Some(id) if codec.displayed.contains(id) => {
                    let id = *id;
                    codec.held.pop_front();
                    codec.displayed.retain(|d| *d != id);
                    freed.push(id);
                }
                _ => break,
            }
        }

        write_id_list(&mut out_args.output_id, &outputs);
        write_id_list(&mut out_args.free_buf_id, &freed);
        out_args.bytes_consumed = in_args.num_bytes;
        out_args.out_bufs_in_use = !codec.held.is_empty();

        EngineStatus::Ok as i32
    }

    fn delete(&mut self, _codec: SimulatedCodec) {
        self.inner.borrow_mut().calls.delete += 1;
    }
}
