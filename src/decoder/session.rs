// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership of the engine, the codec instance and the blocks they exchange.
//!
//! A session goes `Closed -> EngineOpen -> CodecReady`. The codec can be destroyed and created
//! again while the engine stays open, e.g. when the stream geometry changes.

use std::time::Instant;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::align_up;
use crate::codec::CodecVariant;
use crate::codec::ParameterBlocks;
use crate::codec::MACROBLOCK_SIZE;
use crate::decoder::bridge::PreparedOutput;
use crate::decoder::geometry::Geometry;
use crate::decoder::DecoderOptions;
use crate::decoder::Error;
use crate::decoder::Result;
use crate::decoder::Unimplemented;
use crate::engine::id_list;
use crate::engine::BufDesc;
use crate::engine::BufSize;
use crate::engine::BufferDesc;
use crate::engine::CodecEngine;
use crate::engine::ControlCommand;
use crate::engine::EngineHeap;
use crate::engine::EngineStatus;
use crate::engine::InArgs;
use crate::memory::BufferMemory;
use crate::memory::MemoryKind;
use crate::memory::PhysicalBuffer;
use crate::memory::TilerAllocator;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    EngineOpen,
    CodecReady,
}

/// Where a codec variant writes the access unit to decode.
pub struct InputStaging<'a> {
    buffer: &'a mut PhysicalBuffer,
    in_args: &'a mut InArgs,
    in_bufs: &'a mut BufDesc,
    submitted: bool,
}

impl<'a> InputStaging<'a> {
    fn new(
        buffer: &'a mut PhysicalBuffer,
        in_args: &'a mut InArgs,
        in_bufs: &'a mut BufDesc,
    ) -> Self {
        Self {
            buffer,
            in_args,
            in_bufs,
            submitted: false,
        }
    }

    /// Size of the physical input buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Copies `data` to the physical input buffer as the access unit of the next process call.
    /// Only one access unit can be submitted per call.
    pub fn submit(&mut self, data: &[u8]) -> Result<()> {
        if self.submitted {
            return Err(Error::NotImplemented(Unimplemented::MultipleAccessUnits));
        }
        if data.len() > self.capacity() {
            return Err(Error::InputOverflow {
                len: data.len(),
                capacity: self.capacity(),
            });
        }

        self.buffer.write(data)?;
        // Bounded by the input buffer, which is sized from a u32.
        let len = data.len() as u32;
        self.in_args.num_bytes = len;
        self.in_bufs.descs[0].size = BufSize::Bytes(len);
        self.submitted = true;

        Ok(())
    }
}

/// Results of a successful process call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Buffers ready for display, in display order.
    pub output_ids: Vec<i32>,
    /// Buffers the codec does not reference anymore.
    pub freed_ids: Vec<i32>,
    /// Whether the codec still holds output buffers.
    pub buffers_in_use: bool,
}

pub struct CodecSession<E: CodecEngine> {
    /// Name of the owning element, for logging.
    name: String,
    engine: E,
    allocator: TilerAllocator,
    variant: Box<dyn CodecVariant>,
    options: DecoderOptions,

    handle: Option<E::Session>,
    blocks: Option<ParameterBlocks>,
    codec: Option<E::Codec>,
    input: Option<PhysicalBuffer>,
}

impl<E: CodecEngine> CodecSession<E> {
    pub fn new(
        name: &str,
        engine: E,
        allocator: TilerAllocator,
        variant: Box<dyn CodecVariant>,
        options: DecoderOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            engine,
            allocator,
            variant,
            options,
            handle: None,
            blocks: None,
            codec: None,
            input: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.codec.is_some() {
            SessionState::CodecReady
        } else if self.handle.is_some() {
            SessionState::EngineOpen
        } else {
            SessionState::Closed
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn variant(&self) -> &dyn CodecVariant {
        self.variant.as_ref()
    }

    pub fn allocator(&self) -> &TilerAllocator {
        &self.allocator
    }

    pub fn blocks(&self) -> Option<&ParameterBlocks> {
        self.blocks.as_ref()
    }

    /// Opens the engine and allocates the parameter blocks. Does nothing if the engine is
    /// already open.
    pub fn open_engine(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        debug!("{}: opening engine {}", self.name, self.options.engine_name);
        let handle = self
            .engine
            .open(&self.options.engine_name)
            .ok_or_else(|| Error::EngineOpen {
                name: self.options.engine_name.clone(),
            })?;

        let sizes = self.variant.info().sizes;
        match self
            .variant
            .allocate_parameters(&mut EngineHeap(&mut self.engine), &sizes)
        {
            Ok(blocks) => {
                self.blocks = Some(blocks);
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.engine.close(handle);
                Err(e.into())
            }
        }
    }

    /// Destroys the codec, then closes the engine and frees the parameter blocks. Safe to call in
    /// any state.
    pub fn close_engine(&mut self) {
        self.destroy_codec();

        if let Some(handle) = self.handle.take() {
            debug!("{}: closing engine", self.name);
            self.engine.close(handle);
        }

        if let Some(blocks) = self.blocks.take() {
            blocks.release(&mut EngineHeap(&mut self.engine));
        }
    }

    /// Creates and configures the codec for `geometry`, replacing any existing one, and allocates
    /// the input buffer.
    pub fn create_codec(&mut self, geometry: &Geometry) -> Result<()> {
        self.destroy_codec();

        let state = self.state();
        let (Some(handle), Some(blocks)) = (self.handle.as_mut(), self.blocks.as_mut()) else {
            error!("{}: no engine", self.name);
            return Err(Error::InvalidState {
                operation: "create a codec",
                state,
            });
        };

        // These need to be set before creation.
        blocks.params.max_width = align_up(geometry.width, MACROBLOCK_SIZE);
        blocks.params.max_height = align_up(geometry.height, MACROBLOCK_SIZE);

        let codec_name = self.variant.info().codec_name;
        debug!("{}: creating codec {}", self.name, codec_name);
        let mut codec = self
            .engine
            .create(handle, codec_name, &blocks.params)
            .ok_or(Error::CodecCreate { codec: codec_name })?;

        let status = self.engine.control(
            &mut codec,
            ControlCommand::SetParams,
            &blocks.dyn_params,
            &mut blocks.status,
        );
        if status != EngineStatus::Ok as i32 {
            error!(
                "{}: failed to set params: {} ({:08x})",
                self.name,
                EngineStatus::describe(status),
                blocks.status.extended_error
            );
            if self.options.delete_codec {
                self.engine.delete(codec);
            }
            return Err(Error::CodecConfigure { status });
        }

        let input = self
            .allocator
            .allocate_linear(geometry.width * geometry.height)
            .map_err(Error::from)
            .and_then(|input| match input.phys() {
                Some(phys) => Ok((input, phys)),
                None => Err(anyhow!("input buffer has no physical address").into()),
            });
        let (input, phys) = match input {
            Ok(input) => input,
            Err(e) => {
                if self.options.delete_codec {
                    self.engine.delete(codec);
                }
                return Err(e);
            }
        };

        blocks.in_bufs.num_bufs = 1;
        blocks.in_bufs.descs[0] = BufferDesc {
            buf: phys,
            mem_type: MemoryKind::Raw as i16,
            size: BufSize::Bytes(0),
        };
        blocks.out_bufs.num_bufs = 0;

        info!(
            "{}: codec {} ready for {}x{}",
            self.name, codec_name, geometry.width, geometry.height
        );
        self.codec = Some(codec);
        self.input = Some(input);

        Ok(())
    }

    /// Drops the codec and its input buffer.
    pub fn destroy_codec(&mut self) {
        if let Some(codec) = self.codec.take() {
            if self.options.delete_codec {
                debug!("{}: deleting codec", self.name);
                self.engine.delete(codec);
            } else {
                // Deleting a codec crashes the IVA-HD firmware, so the object is abandoned.
                debug!("{}: abandoning codec object", self.name);
            }
        }

        self.input = None;
    }

    /// Stages `data` through the codec variant. Returns the part the variant could not submit.
    pub fn push_input<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8]> {
        let state = self.state();
        let (Some(input), Some(blocks)) = (self.input.as_mut(), self.blocks.as_mut()) else {
            return Err(Error::InvalidState {
                operation: "push input",
                state,
            });
        };

        let mut staging = InputStaging::new(input, &mut blocks.in_args, &mut blocks.in_bufs);
        let rest = self.variant.push_input(data, &mut staging)?;
        if !staging.is_submitted() {
            return Err(anyhow!("{} staged no input", self.variant.info().codec_name).into());
        }

        debug!("{}: push: {} bytes", self.name, blocks.in_args.num_bytes);
        Ok(rest)
    }

    /// Points the output descriptors and the input identifier at a registered output buffer.
    pub fn bind_output(&mut self, output: &PreparedOutput) -> Result<()> {
        let state = self.state();
        let Some(blocks) = self.blocks.as_mut() else {
            return Err(Error::InvalidState {
                operation: "bind an output buffer",
                state,
            });
        };

        let shape = &output.shape;
        let out_bufs = &mut blocks.out_bufs;
        out_bufs.num_bufs = 2;
        out_bufs.descs[0] = BufferDesc {
            buf: output.luma,
            mem_type: shape.luma_kind as i16,
            size: BufSize::Tiled {
                width: shape.width,
                height: shape.height,
            },
        };
        // The interleaved chroma plane is as wide as the luma one and covers every luma line.
        out_bufs.descs[1] = BufferDesc {
            buf: output.chroma,
            mem_type: shape.chroma_kind as i16,
            size: BufSize::Tiled {
                width: shape.width,
                height: shape.height.div_ceil(2),
            },
        };
        blocks.in_args.input_id = output.id.get();

        Ok(())
    }

    /// Runs the blocking process call on the staged input.
    pub fn process(&mut self) -> Result<ProcessOutput> {
        let state = self.state();
        let (Some(codec), Some(blocks)) = (self.codec.as_mut(), self.blocks.as_mut()) else {
            return Err(Error::InvalidState {
                operation: "process",
                state,
            });
        };

        let start = Instant::now();
        let status = self.engine.process(
            codec,
            &blocks.in_bufs,
            &blocks.out_bufs,
            &blocks.in_args,
            &mut blocks.out_args,
        );
        trace!(
            "{}: process returned in {}us",
            self.name,
            start.elapsed().as_micros()
        );

        if status != EngineStatus::Ok as i32 {
            return Err(Error::Process {
                status,
                extended_error: blocks.out_args.extended_error,
            });
        }

        Ok(ProcessOutput {
            output_ids: id_list(&blocks.out_args.output_id).collect(),
            freed_ids: id_list(&blocks.out_args.free_buf_id).collect(),
            buffers_in_use: blocks.out_args.out_bufs_in_use,
        })
    }

    /// Flushes the codec. Succeeds trivially without a codec.
    pub fn flush(&mut self) -> Result<()> {
        if self.codec.is_none() {
            warn!("{}: no codec", self.name);
            return Ok(());
        }

        warn!("{}: flushing the codec is not implemented", self.name);
        Err(Error::NotImplemented(Unimplemented::Flush))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::H264;
    use crate::codec::mpeg4::Mpeg4;
    use crate::decoder::bridge::BufferId;
    use crate::decoder::bridge::OutputShape;
    use crate::decoder::geometry::negotiate;
    use crate::decoder::StreamCaps;
    use crate::engine::simulated::SimulatedEngine;
    use crate::memory::classify_region;
    use crate::memory::simulated::SimulatedMemory;
    use crate::memory::PhysAddr;
    use crate::Fraction;

    fn session(engine: &SimulatedEngine) -> CodecSession<SimulatedEngine> {
        session_with(engine, DecoderOptions::default())
    }

    fn session_with(
        engine: &SimulatedEngine,
        options: DecoderOptions,
    ) -> CodecSession<SimulatedEngine> {
        CodecSession::new(
            "test0",
            engine.clone(),
            TilerAllocator::new(SimulatedMemory::new()),
            Box::new(H264),
            options,
        )
    }

    fn geometry(width: i32, height: i32) -> Geometry {
        negotiate(&StreamCaps::new(width, height, Fraction::new(30, 1)), &H264).unwrap()
    }

    fn fake_output(id: i32) -> PreparedOutput {
        PreparedOutput {
            id: BufferId::new(id).unwrap(),
            luma: PhysAddr(0x6000_0000),
            chroma: PhysAddr(0x6800_0000),
            shape: OutputShape {
                luma_kind: MemoryKind::Tiled8,
                chroma_kind: MemoryKind::Tiled16,
                width: 320,
                height: 240,
            },
        }
    }

    #[test]
    fn state_machine() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        assert_eq!(session.state(), SessionState::Closed);

        session.open_engine().unwrap();
        assert_eq!(session.state(), SessionState::EngineOpen);
        assert_eq!(engine.live_shared_blocks(), 7);

        session.create_codec(&geometry(320, 240)).unwrap();
        assert_eq!(session.state(), SessionState::CodecReady);

        // Recreating stays within the open engine.
        session.create_codec(&geometry(640, 480)).unwrap();
        assert_eq!(session.state(), SessionState::CodecReady);
        assert_eq!(engine.calls().open, 1);
        assert_eq!(engine.calls().create, 2);

        session.close_engine();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!engine.is_open());
        assert_eq!(engine.live_shared_blocks(), 0);
    }

    #[test]
    fn open_is_idempotent() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.open_engine().unwrap();
        assert_eq!(engine.calls().open, 1);
        assert_eq!(engine.live_shared_blocks(), 7);
    }

    #[test]
    fn open_failure_leaves_session_closed() {
        let engine = SimulatedEngine::new();
        engine.fail_open(true);
        let mut session = session(&engine);

        let err = session.open_engine().unwrap_err();
        assert!(matches!(err, Error::EngineOpen { ref name } if name == "ivahd_vidsvr"));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(engine.live_shared_blocks(), 0);
    }

    #[test]
    fn block_allocation_failure_closes_the_engine() {
        let engine = SimulatedEngine::new();
        engine.set_shared_heap_limit(Some(4));
        let mut session = session(&engine);

        assert!(matches!(session.open_engine(), Err(Error::Allocation(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!engine.is_open());
        assert_eq!(engine.live_shared_blocks(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.close_engine();

        session.open_engine().unwrap();
        session.create_codec(&geometry(320, 240)).unwrap();
        session.close_engine();
        session.close_engine();

        assert_eq!(engine.calls().close, 1);
        assert_eq!(engine.live_shared_blocks(), 0);
        assert!(session.blocks().is_none());
    }

    #[test]
    fn creation_parameters() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.create_codec(&geometry(1278, 719)).unwrap();

        let params = engine.last_params().unwrap();
        assert_eq!(params.max_width, 1280);
        assert_eq!(params.max_height, 720);
        assert_eq!(engine.last_codec_name().as_deref(), Some("ivahd_h264dec"));
        assert_eq!(engine.calls().control, 1);

        let in_bufs = &session.blocks().unwrap().in_bufs;
        assert_eq!(in_bufs.num_bufs, 1);
        assert_eq!(in_bufs.descs[0].mem_kind(), Some(MemoryKind::Raw));
        assert_eq!(
            classify_region(in_bufs.descs[0].buf),
            Some(MemoryKind::Raw)
        );
    }

    #[test]
    fn create_requires_an_open_engine() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        assert!(matches!(
            session.create_codec(&geometry(320, 240)),
            Err(Error::InvalidState {
                state: SessionState::Closed,
                ..
            })
        ));
        assert_eq!(engine.calls().create, 0);
    }

    #[test]
    fn create_and_configure_failures() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();

        engine.fail_create(true);
        assert!(matches!(
            session.create_codec(&geometry(320, 240)),
            Err(Error::CodecCreate {
                codec: "ivahd_h264dec"
            })
        ));
        assert_eq!(session.state(), SessionState::EngineOpen);

        engine.fail_create(false);
        engine.set_control_status(-1);
        assert!(matches!(
            session.create_codec(&geometry(320, 240)),
            Err(Error::CodecConfigure { status: -1 })
        ));
        assert_eq!(session.state(), SessionState::EngineOpen);
        assert_eq!(engine.calls().delete, 0);
    }

    #[test]
    fn input_allocation_failure() {
        let engine = SimulatedEngine::new();
        let memory = SimulatedMemory::new();
        memory.set_budget(Some(0));
        let mut session = CodecSession::new(
            "test0",
            engine.clone(),
            TilerAllocator::new(memory),
            Box::new(H264),
            DecoderOptions {
                delete_codec: true,
                ..Default::default()
            },
        );
        session.open_engine().unwrap();

        assert!(matches!(
            session.create_codec(&geometry(320, 240)),
            Err(Error::Allocation(_))
        ));
        assert_eq!(session.state(), SessionState::EngineOpen);
        assert_eq!(engine.calls().delete, 1);
    }

    #[test]
    fn codec_deletion_is_skipped_by_default() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.create_codec(&geometry(320, 240)).unwrap();
        session.destroy_codec();
        assert_eq!(engine.calls().delete, 0);
        assert_eq!(session.state(), SessionState::EngineOpen);

        let mut session = session_with(
            &engine,
            DecoderOptions {
                delete_codec: true,
                ..Default::default()
            },
        );
        session.open_engine().unwrap();
        session.create_codec(&geometry(320, 240)).unwrap();
        session.close_engine();
        assert_eq!(engine.calls().delete, 1);
    }

    #[test]
    fn process_requires_a_codec() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        assert!(matches!(
            session.process(),
            Err(Error::InvalidState {
                operation: "process",
                state: SessionState::Closed
            })
        ));

        session.open_engine().unwrap();
        assert!(matches!(
            session.process(),
            Err(Error::InvalidState {
                state: SessionState::EngineOpen,
                ..
            })
        ));
        assert_eq!(engine.calls().process, 0);
    }

    #[test]
    fn staged_input_and_process() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.create_codec(&geometry(320, 240)).unwrap();

        let rest = session.push_input(&[0, 0, 0, 1, 0x65]).unwrap();
        assert!(rest.is_empty());
        session.bind_output(&fake_output(3)).unwrap();

        let blocks = session.blocks().unwrap();
        assert_eq!(blocks.in_args.num_bytes, 5);
        assert_eq!(blocks.in_args.input_id, 3);
        assert_eq!(blocks.in_bufs.descs[0].size, BufSize::Bytes(5));
        assert_eq!(blocks.out_bufs.num_bufs, 2);
        assert_eq!(
            blocks.out_bufs.descs[1].size,
            BufSize::Tiled {
                width: 320,
                height: 120
            }
        );
        assert_eq!(blocks.out_bufs.descs[1].mem_kind(), Some(MemoryKind::Tiled16));

        let output = session.process().unwrap();
        assert_eq!(output.output_ids, vec![3]);
        assert_eq!(output.freed_ids, vec![3]);
        assert!(!output.buffers_in_use);
    }

    #[test]
    fn process_error_carries_extended_code() {
        let engine = SimulatedEngine::new();
        engine.fail_process_at(0, -1, 0x0000_8010);
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.create_codec(&geometry(320, 240)).unwrap();
        session.push_input(&[1, 2, 3]).unwrap();
        session.bind_output(&fake_output(1)).unwrap();

        assert!(matches!(
            session.process(),
            Err(Error::Process {
                status: -1,
                extended_error: 0x8010
            })
        ));
    }

    #[test]
    fn oversized_input() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.create_codec(&geometry(64, 64)).unwrap();

        let capacity = session.input.as_ref().unwrap().len();
        let data = vec![0u8; capacity + 1];
        assert!(matches!(
            session.push_input(&data),
            Err(Error::InputOverflow { len, .. }) if len == capacity + 1
        ));
    }

    #[test]
    fn flush_is_not_implemented() {
        let engine = SimulatedEngine::new();
        let mut session = session(&engine);
        session.open_engine().unwrap();
        session.flush().unwrap();

        session.create_codec(&geometry(320, 240)).unwrap();
        assert!(matches!(
            session.flush(),
            Err(Error::NotImplemented(Unimplemented::Flush))
        ));
    }

    #[test]
    fn variant_overrides_reach_the_engine() {
        let engine = SimulatedEngine::new();
        let mut session = CodecSession::new(
            "test0",
            engine.clone(),
            TilerAllocator::new(SimulatedMemory::new()),
            Box::new(Mpeg4),
            DecoderOptions::default(),
        );
        session.open_engine().unwrap();
        session.create_codec(&geometry(352, 288)).unwrap();

        assert_eq!(engine.last_codec_name().as_deref(), Some("ivahd_mpeg4dec"));
        assert_eq!(engine.last_dyn_params().unwrap().late_acquire_arg, Some(-1));
    }
}
