//! Test helper utilities
//!
//! Shared fakes for the scheduler, registry and API tests

#![allow(dead_code)]

pub mod fakes;

pub use fakes::{
    playing_track, track, valid_credential, FakeExchange, FakePlayer, MemoryCredentials,
    MemoryQueue, NoCues,
};

use cued_common::events::EventBus;
use std::sync::Arc;
use std::time::Duration;

use cued_worker::credentials::CredentialLifecycle;
use cued_worker::cues::CueResolver;
use cued_worker::registry::JobQueue;
use cued_worker::scheduler::SessionEnvironment;

/// Session environment over the given fakes
pub fn environment(
    player: Arc<FakePlayer>,
    credentials: Arc<MemoryCredentials>,
    exchange: Arc<FakeExchange>,
    queue: Arc<dyn JobQueue>,
    cooldown: Duration,
    event_bus: EventBus,
) -> SessionEnvironment {
    SessionEnvironment {
        credentials: CredentialLifecycle::new(credentials, exchange, cooldown, event_bus.clone()),
        playback: player,
        cues: CueResolver::new(Arc::new(NoCues)),
        queue,
        event_bus,
    }
}
