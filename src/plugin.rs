// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Registration table of the decoder elements.
//!
//! Codec availability on the DSP is not checked up front: every element is listed, and a missing
//! codec only shows up when the element creates it.

use std::rc::Rc;

use crate::codec::h264::H264;
use crate::codec::mpeg2::Mpeg2;
use crate::codec::mpeg4::Mpeg4;
use crate::codec::rv::RealVideo;
use crate::codec::vc1::Vc1;
use crate::codec::vp6::Vp6;
use crate::codec::vp7::Vp7;
use crate::codec::CodecVariant;
use crate::decoder::element::DucatiVidDec;
use crate::decoder::DecoderOptions;
use crate::decoder::Downstream;
use crate::engine::CodecEngine;
use crate::memory::MemoryManager;

/// Caps template of the source pad, shared by every element.
pub const SRC_CAPS: &str = "video/x-raw-yuv-strided, format=NV12, rowstride=[0, max]";

pub struct PluginInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub license: &'static str,
}

pub const PLUGIN: PluginInfo = PluginInfo {
    name: "ducati",
    description: "Hardware accelerated codecs for OMAP4",
    license: "LGPL",
};

/// Priority of an element when the pipeline picks a decoder automatically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    None,
    Marginal,
    Secondary,
    Primary,
}

/// Describes an element and builds its codec variant.
pub struct ElementFactory {
    pub name: &'static str,
    /// Human readable name of the element.
    pub long_name: &'static str,
    pub rank: Rank,
    pub sink_caps: &'static str,
    pub src_caps: &'static str,
    variant: fn() -> Box<dyn CodecVariant>,
}

impl ElementFactory {
    fn new(variant: fn() -> Box<dyn CodecVariant>) -> Self {
        let info = variant().info();
        Self {
            name: info.element_name,
            long_name: info.long_name,
            rank: Rank::Primary,
            sink_caps: info.sink_caps,
            src_caps: SRC_CAPS,
            variant,
        }
    }

    pub fn variant(&self) -> Box<dyn CodecVariant> {
        (self.variant)()
    }
}

/// The element factories of the plugin, in registration order.
pub fn factories() -> Vec<ElementFactory> {
    vec![
        ElementFactory::new(|| Box::new(H264)),
        ElementFactory::new(|| Box::new(Mpeg4)),
        ElementFactory::new(|| Box::new(Mpeg2)),
        ElementFactory::new(|| Box::new(Vc1)),
        ElementFactory::new(|| Box::new(Vp6)),
        ElementFactory::new(|| Box::new(Vp7)),
        ElementFactory::new(|| Box::new(RealVideo)),
    ]
}

pub fn find_factory(name: &str) -> Option<ElementFactory> {
    factories().into_iter().find(|f| f.name == name)
}

/// Instantiates the element registered as `factory_name`, or `None` if there is no such element.
pub fn make_element<E: CodecEngine, D: Downstream>(
    factory_name: &str,
    instance_name: &str,
    engine: E,
    memory: Rc<dyn MemoryManager>,
    downstream: D,
    options: DecoderOptions,
) -> Option<DucatiVidDec<E, D>> {
    let factory = find_factory(factory_name)?;
    log::debug!("creating {} from factory {}", instance_name, factory.name);

    Some(DucatiVidDec::new(
        instance_name,
        factory.variant(),
        engine,
        memory,
        downstream,
        options,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::element::ElementState;
    use crate::decoder::tests::TestSink;
    use crate::decoder::AccessUnit;
    use crate::decoder::StreamCaps;
    use crate::engine::simulated::SimulatedEngine;
    use crate::memory::simulated::SimulatedMemory;
    use crate::Fraction;

    #[test]
    fn registration_order() {
        let names: Vec<_> = factories().iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            [
                "ducatih264dec",
                "ducatimpeg4dec",
                "ducatimpeg2dec",
                "ducativc1dec",
                "ducativp6dec",
                "ducativp7dec",
                "ducatirvdec",
            ]
        );
        assert!(factories()
            .iter()
            .all(|f| f.rank == Rank::Primary && f.src_caps == SRC_CAPS));
        assert_eq!(
            find_factory("ducativc1dec").unwrap().variant().info().codec_name,
            "ivahd_vc1vdec"
        );
        let h264 = find_factory("ducatih264dec").unwrap();
        assert_eq!(h264.sink_caps, "video/x-h264");
        assert_eq!(h264.long_name, h264.variant().info().long_name);
        assert!(factories().iter().all(|f| !f.long_name.is_empty()));
    }

    #[test]
    fn make_elements() {
        let memory = SimulatedMemory::new();
        let engine = SimulatedEngine::new();
        let sink = TestSink::new(memory.clone());

        assert!(make_element(
            "ducatih265dec",
            "x",
            engine.clone(),
            memory.clone(),
            sink.clone(),
            Default::default(),
        )
        .is_none());

        let mut element = make_element(
            "ducatimpeg2dec",
            "ducatimpeg2dec0",
            engine.clone(),
            memory,
            sink.clone(),
            Default::default(),
        )
        .unwrap();
        assert_eq!(element.name(), "ducatimpeg2dec0");

        element.set_state(ElementState::Playing).unwrap();
        element
            .set_sink_caps(&StreamCaps::new(720, 576, Fraction::new(25, 1)))
            .unwrap();
        element
            .decode(&AccessUnit::new(vec![0u8, 0, 1, 0xb3], Some(0), None))
            .unwrap();
        assert_eq!(
            engine.last_codec_name().as_deref(),
            Some("ivahd_mpeg2vdec")
        );
        assert_eq!(sink.state.borrow().frames.len(), 1);
    }
}
