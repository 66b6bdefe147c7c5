//! Shared fixtures for the engine's unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chant_core::store::MemoryStore;
use chant_core::testing::{RecordingNotifier, RecordingSink};
use chant_core::types::{
    AllocationMode, Deliberation, DeliberationId, DeliberationSettings, Idea, UserId,
};

use crate::config::EngineConfig;
use crate::engine::Engine;

pub(crate) struct Harness {
    pub engine: Engine,
    pub sink: Arc<RecordingSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<AtomicU64>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(AtomicU64::new(1_000));
        let ticks = clock.clone();
        let engine = Engine::with_clock(
            Arc::new(MemoryStore::new()),
            notifier.clone(),
            sink.clone(),
            config,
            move || ticks.load(Ordering::SeqCst),
        )
        .with_seed(7);
        Self {
            engine,
            sink,
            notifier,
            clock,
        }
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.clock.fetch_add(ms, Ordering::SeqCst) + ms
    }

    /// Create a deliberation and join `members` extra users named `m0..`.
    pub fn deliberation(&self, settings: DeliberationSettings, members: usize) -> Deliberation {
        let d = self
            .engine
            .create_deliberation(UserId::from("host"), "Where should we go?", settings)
            .unwrap();
        for i in 0..members {
            self.engine.join(d.id, user(i)).unwrap();
        }
        d
    }

    /// Submit `n` anonymous ideas.
    pub fn ideas(&self, d: DeliberationId, n: usize) -> Vec<Idea> {
        (0..n)
            .map(|i| self.engine.submit_idea(d, None, &format!("idea {i}")).unwrap())
            .collect()
    }

    pub fn reload(&self, d: DeliberationId) -> Deliberation {
        self.engine.store().deliberation(&d).unwrap().unwrap()
    }

    pub fn idea(&self, id: chant_core::types::IdeaId) -> Idea {
        self.engine.store().idea(&id).unwrap().unwrap()
    }
}

pub(crate) fn user(i: usize) -> UserId {
    UserId::new(format!("m{i}"))
}

pub(crate) fn fcfs(cell_size: u32) -> DeliberationSettings {
    DeliberationSettings {
        cell_size,
        allocation_mode: AllocationMode::Fcfs,
        ..DeliberationSettings::default()
    }
}

pub(crate) fn continuous(cell_size: u32) -> DeliberationSettings {
    DeliberationSettings {
        cell_size,
        allocation_mode: AllocationMode::Fcfs,
        continuous_flow: true,
        ..DeliberationSettings::default()
    }
}
