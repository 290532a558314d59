// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder element: state changes, negotiation and the per-buffer decode loop.

use std::rc::Rc;

use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::codec::CodecVariant;
use crate::decoder::bridge::BufferBridge;
use crate::decoder::bridge::PreparedOutput;
use crate::decoder::geometry::negotiate;
use crate::decoder::geometry::Geometry;
use crate::decoder::session::CodecSession;
use crate::decoder::session::ProcessOutput;
use crate::decoder::session::SessionState;
use crate::decoder::AccessUnit;
use crate::decoder::BufferRequirements;
use crate::decoder::DecoderOptions;
use crate::decoder::Downstream;
use crate::decoder::Error;
use crate::decoder::ErrorClass;
use crate::decoder::Event;
use crate::decoder::FlowError;
use crate::decoder::FrameMeta;
use crate::decoder::NegotiationError;
use crate::decoder::OutputCaps;
use crate::decoder::Result;
use crate::decoder::StreamCaps;
use crate::decoder::Unimplemented;
use crate::engine::CodecEngine;
use crate::memory::MemoryManager;
use crate::memory::TilerAllocator;

/// Lifecycle states of an element.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl ElementState {
    fn up(self) -> Self {
        match self {
            ElementState::Null => ElementState::Ready,
            ElementState::Ready => ElementState::Paused,
            ElementState::Paused | ElementState::Playing => ElementState::Playing,
        }
    }

    fn down(self) -> Self {
        match self {
            ElementState::Playing => ElementState::Paused,
            ElementState::Paused => ElementState::Ready,
            ElementState::Ready | ElementState::Null => ElementState::Null,
        }
    }
}

/// A hardware video decoder element.
///
/// Calls must be serialized: the element is driven by the thread streaming into it.
pub struct DucatiVidDec<E: CodecEngine, D: Downstream> {
    name: String,
    session: CodecSession<E>,
    bridge: BufferBridge,
    downstream: D,
    state: ElementState,
    geometry: Option<Geometry>,
    /// Set after a fatal error, until the codec is created again.
    stream_failed: bool,
}

impl<E: CodecEngine, D: Downstream> DucatiVidDec<E, D> {
    /// Creates an element called `name` decoding with `variant`.
    pub fn new(
        name: &str,
        variant: Box<dyn CodecVariant>,
        engine: E,
        memory: Rc<dyn MemoryManager>,
        downstream: D,
        options: DecoderOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            session: CodecSession::new(name, engine, TilerAllocator::new(memory), variant, options),
            bridge: BufferBridge::new(),
            downstream,
            state: ElementState::Null,
            geometry: None,
            stream_failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn session(&self) -> &CodecSession<E> {
        &self.session
    }

    pub fn bridge(&self) -> &BufferBridge {
        &self.bridge
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    pub fn downstream(&self) -> &D {
        &self.downstream
    }

    pub fn downstream_mut(&mut self) -> &mut D {
        &mut self.downstream
    }

    pub fn is_stream_failed(&self) -> bool {
        self.stream_failed
    }

    /// Walks the state transitions up to `target`, one at a time. On failure the element stays in
    /// the last state it reached.
    pub fn set_state(&mut self, target: ElementState) -> Result<()> {
        while self.state != target {
            let next = if target > self.state {
                self.state.up()
            } else {
                self.state.down()
            };

            info!("{}: changing state {:?} -> {:?}", self.name, self.state, next);
            self.change_state(next)?;
            self.state = next;
        }

        Ok(())
    }

    fn change_state(&mut self, next: ElementState) -> Result<()> {
        match (self.state, next) {
            (ElementState::Null, ElementState::Ready) => {
                self.session.open_engine().map_err(|e| {
                    error!("{}: could not open: {}", self.name, e);
                    e
                })?;
            }
            (ElementState::Ready, ElementState::Null) => self.teardown(),
            _ => (),
        }

        Ok(())
    }

    /// Releases the codec, the lent buffers and the engine.
    fn teardown(&mut self) {
        self.session.destroy_codec();
        self.bridge.clear();
        self.session.close_engine();
        self.geometry = None;
        self.stream_failed = false;
    }

    /// Negotiates the stream described by `caps` and sets the resulting output format downstream.
    pub fn set_sink_caps(&mut self, caps: &StreamCaps) -> Result<OutputCaps> {
        info!("{}: setcaps (sink): {:?}", self.name, caps);

        let geometry = negotiate(caps, self.session.variant()).map_err(|e| {
            warn!("{}: {}", self.name, e);
            e
        })?;

        let out_caps = geometry.output_caps();
        debug!("{}: outcaps: {}", self.name, out_caps);
        if !self.downstream.set_caps(&out_caps) {
            warn!("{}: failed to set caps", self.name);
            return Err(NegotiationError::Refused(out_caps.to_string()).into());
        }

        if self.geometry != Some(geometry) || self.stream_failed {
            // The codec is created for a given size, and lazily.
            self.session.destroy_codec();
            self.bridge.clear();
            self.stream_failed = false;
        }
        self.geometry = Some(geometry);

        Ok(out_caps)
    }

    /// Answers the downstream buffers query, once negotiated.
    pub fn query_buffers(&self) -> Option<BufferRequirements> {
        let requirements = self.geometry.as_ref()?.requirements();
        debug!(
            "{}: min buffers: {}, min dimensions: {}x{}",
            self.name, requirements.min_buffers, requirements.min_width, requirements.min_height
        );
        Some(requirements)
    }

    /// Handles an event from upstream. Returns whether downstream handled it.
    pub fn handle_event(&mut self, event: Event) -> Result<bool> {
        info!("{}: event {:?}", self.name, event);

        if let Event::Eos | Event::FlushStop = event {
            self.session.flush().map_err(|e| {
                error!("{}: could not flush", self.name);
                e
            })?;
        }

        Ok(self.downstream.push_event(event))
    }

    /// Records a failure. Session errors make the stream fail, which is reported once, and release
    /// the codec along with the buffers lent to it.
    fn fail(&mut self, e: Error) -> Error {
        match e.class() {
            ErrorClass::Session => {
                if !self.stream_failed {
                    error!("{}: stream failed: {}", self.name, e);
                    self.stream_failed = true;
                }
                self.session.destroy_codec();
                self.bridge.clear();
            }
            ErrorClass::Flow => debug!("{}: {}", self.name, e),
            _ => warn!("{}: dropping frame: {}", self.name, e),
        }

        e
    }

    /// Decodes one access unit and pushes the frames it makes ready downstream. The access unit
    /// is left to the caller, who can submit it again after a flow error.
    pub fn decode(&mut self, au: &AccessUnit) -> Result<()> {
        if self.session.state() == SessionState::Closed {
            error!("{}: no engine", self.name);
            return Err(Error::InvalidState {
                operation: "decode",
                state: SessionState::Closed,
            });
        }
        if self.stream_failed {
            return Err(Error::StreamFailed);
        }
        let geometry = self.geometry.ok_or(NegotiationError::NotNegotiated)?;

        // Get the output buffer first, so downstream flow errors reach upstream untouched.
        let buffer = self
            .downstream
            .alloc_buffer(geometry.outsize, &geometry.output_caps())
            .map_err(|e| {
                warn!("{}: could not get an output buffer: {}", self.name, e);
                Error::Flow(e)
            })?;

        if self.session.state() != SessionState::CodecReady {
            self.bridge.clear();
            if let Err(e) = self.session.create_codec(&geometry) {
                return Err(self.fail(e));
            }
        }

        let meta = FrameMeta {
            timestamp: au.timestamp,
            duration: au.duration,
        };
        let prepared = self
            .bridge
            .register_output(buffer, meta, &geometry, self.session.allocator())
            .map_err(|e| self.fail(e))?;

        let output = match self.submit(&au.data, &prepared) {
            Ok(output) => output,
            Err(e) => {
                // The codec did not take the buffer.
                if let Err(e) = self.bridge.release(prepared.id.get()) {
                    debug!("{}: {}", self.name, e);
                }
                return Err(self.fail(e));
            }
        };

        self.deliver(output)
    }

    fn submit(&mut self, data: &[u8], prepared: &PreparedOutput) -> Result<ProcessOutput> {
        self.session.bind_output(prepared)?;

        let rest = self.session.push_input(data)?;
        if !rest.is_empty() {
            warn!(
                "{}: {} bytes left over, cannot push more than one access unit",
                self.name,
                rest.len()
            );
            return Err(Error::NotImplemented(Unimplemented::MultipleAccessUnits));
        }

        self.session.process()
    }

    /// Pushes the frames the codec output, in its order, then releases the buffers it freed.
    fn deliver(&mut self, output: ProcessOutput) -> Result<()> {
        let mut flow: Option<FlowError> = None;

        for id in output.output_ids {
            let frame = self.bridge.resolve(id).map_err(|e| self.fail(e))?;
            if let Err(e) = self.downstream.push(frame) {
                debug!("{}: push of buffer {} returned {}", self.name, id, e);
                flow.get_or_insert(e);
            }
        }

        for id in output.freed_ids {
            self.bridge.release(id).map_err(|e| self.fail(e))?;
        }

        if output.buffers_in_use {
            // TODO: throttle input when the codec holds every buffer downstream can provide.
            warn!("{}: codec still holds output buffers", self.name);
        }

        match flow {
            Some(e) => Err(Error::Flow(e)),
            None => Ok(()),
        }
    }
}

impl<E: CodecEngine, D: Downstream> Drop for DucatiVidDec<E, D> {
    fn drop(&mut self) {
        debug!("{}: finalize", self.name);
        self.teardown();
    }
}
