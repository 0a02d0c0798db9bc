//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities

// Requires the 'sim' feature

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use rand::distributions::{Distribution, Standard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use bridgertc::common::{MediaDirection, MediaType};
use bridgertc::core::call_manager::CallManager;
use bridgertc::core::conference::{PayloadType, RelayAddress};
use bridgertc::core::events::EventStream;
use bridgertc::core::platform::CallConfig;
use bridgertc::core::signaling::{MediaDescription, SessionInitiate};
use bridgertc::sim::{SimAutoAnswer, SimTransport};

macro_rules! error_line {
    () => {
        concat!(module_path!(), ":", line!())
    };
}

pub struct Prng {
    seed: u64,
    rng: Mutex<Option<ChaCha20Rng>>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(None),
        }
    }

    // Use a freshly seeded PRNG for each test
    pub fn init(&self) {
        let mut opt = self.rng.lock().unwrap();
        let _ = opt.replace(ChaCha20Rng::seed_from_u64(self.seed));
    }

    pub fn gen<T>(&self) -> T
    where
        Standard: Distribution<T>,
    {
        self.rng.lock().unwrap().as_mut().unwrap().gen::<T>()
    }
}

lazy_static! {
    pub static ref PRNG: Prng = Prng::new(0xce11);
}

pub fn test_init() {
    let _ = env_logger::builder().is_test(true).try_init();
    PRNG.init();
}

pub const LOCAL_ADDRESS: &str = "alice@example.com";
pub const BRIDGE_ADDRESS: &str = "bridge.example.com";

pub struct TestContext {
    pub transport: Arc<SimTransport>,
    pub manager: CallManager,
    pub auto_answer: Arc<SimAutoAnswer>,
    pub events: EventStream,
}

pub fn test_context(config: CallConfig) -> TestContext {
    test_init();
    let transport = Arc::new(SimTransport::new(
        LOCAL_ADDRESS,
        Some(RelayAddress::new(BRIDGE_ADDRESS)),
    ));
    let auto_answer = Arc::new(SimAutoAnswer::new());
    let (manager, events) = CallManager::new(config, transport.clone(), auto_answer.clone());
    TestContext {
        transport,
        manager,
        auto_answer,
        events,
    }
}

pub fn audio_description() -> MediaDescription {
    let mut description = MediaDescription::new(MediaType::Audio, MediaDirection::SendRecv);
    description
        .payload_types
        .push(PayloadType::new(111, "opus", 48000));
    description
}

pub fn video_description() -> MediaDescription {
    let mut description = MediaDescription::new(MediaType::Video, MediaDirection::SendRecv);
    description
        .payload_types
        .push(PayloadType::new(100, "VP8", 90000));
    description
}

pub fn session_initiate(
    sid: &str,
    from: &str,
    contents: Vec<MediaDescription>,
) -> SessionInitiate {
    SessionInitiate {
        sid: sid.to_string(),
        from: from.to_string(),
        initiator: None,
        contents,
        transfer: None,
        conference_focus: None,
    }
}
