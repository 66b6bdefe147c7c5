//! Shared fixtures for the scenario, concurrency and property suites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chant_core::error::StoreError;
use chant_core::store::{Condition, DeliberationStore, MemoryStore, WriteSet};
use chant_core::testing::{RecordingNotifier, RecordingSink};
use chant_core::types::{
    AllocationMode, Cell, CellId, CellParticipation, Comment, CommentId, Deliberation,
    DeliberationId, DeliberationSettings, Idea, IdeaId, Prediction, UserId, UserStats, Vote,
};
use chant_engine::{Engine, EngineConfig};

/// Fixed engine clock.
pub const NOW: u64 = 10_000;

/// An engine over a fresh in-memory store with recording collaborators.
pub struct World {
    pub engine: Arc<Engine>,
    pub sink: Arc<RecordingSink>,
    pub notifier: Arc<RecordingNotifier>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default(), 11)
    }

    pub fn with_config(config: EngineConfig, seed: u64) -> Self {
        Self::over(Arc::new(MemoryStore::new()), config, seed)
    }

    /// An engine over `store` with the default config.
    pub fn with_store(store: Arc<dyn DeliberationStore>) -> Self {
        Self::over(store, EngineConfig::default(), 11)
    }

    fn over(store: Arc<dyn DeliberationStore>, config: EngineConfig, seed: u64) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Engine::with_clock(
            store,
            notifier.clone(),
            sink.clone(),
            config,
            || NOW,
        )
        .with_seed(seed);
        Self {
            engine: Arc::new(engine),
            sink,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeliberationStore> {
        self.engine.store()
    }

    /// A deliberation created by `member(0)` with `members - 1` more joiners.
    pub fn deliberation(&self, settings: DeliberationSettings, members: usize) -> Deliberation {
        let d = self
            .engine
            .create_deliberation(member(0), "What should the library fund next year?", settings)
            .expect("create deliberation");
        for i in 1..members {
            self.engine.join(d.id, member(i)).expect("join");
        }
        d
    }

    /// Submit one anonymous idea per text.
    pub fn ideas(&self, d: DeliberationId, count: usize) -> Vec<Idea> {
        (0..count)
            .map(|i| {
                self.engine
                    .submit_idea(d, None, &format!("proposal {i}"))
                    .expect("submit idea")
            })
            .collect()
    }

    pub fn reload(&self, d: DeliberationId) -> Deliberation {
        self.store()
            .deliberation(&d)
            .expect("store")
            .expect("deliberation exists")
    }

    pub fn idea(&self, id: IdeaId) -> Idea {
        self.store().idea(&id).expect("store").expect("idea exists")
    }

    pub fn cells_at(&self, d: DeliberationId, tier: u32) -> Vec<Cell> {
        self.store().cells_at_tier(&d, tier).expect("store")
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory store whose conditional commits take `delay`, like a round
/// trip to a real database, and whose idea listings can be made to fail.
pub struct FlakyStore {
    inner: MemoryStore,
    delay: Duration,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            failing: AtomicBool::new(false),
        }
    }

    /// While set, [`DeliberationStore::ideas`] returns a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DeliberationStore for FlakyStore {
    fn next_id(&self) -> Result<u64, StoreError> {
        self.inner.next_id()
    }

    fn deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError> {
        self.inner.deliberation(id)
    }

    fn deliberation_ids(&self) -> Result<Vec<DeliberationId>, StoreError> {
        self.inner.deliberation_ids()
    }

    fn idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError> {
        self.inner.idea(id)
    }

    fn ideas(&self, deliberation: &DeliberationId) -> Result<Vec<Idea>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.ideas(deliberation)
    }

    fn cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError> {
        self.inner.cell(id)
    }

    fn cells(&self, deliberation: &DeliberationId) -> Result<Vec<Cell>, StoreError> {
        self.inner.cells(deliberation)
    }

    fn members(&self, deliberation: &DeliberationId) -> Result<Vec<UserId>, StoreError> {
        self.inner.members(deliberation)
    }

    fn participants(&self, cell: &CellId) -> Result<Vec<CellParticipation>, StoreError> {
        self.inner.participants(cell)
    }

    fn votes(&self, cell: &CellId) -> Result<Vec<Vote>, StoreError> {
        self.inner.votes(cell)
    }

    fn predictions(&self, deliberation: &DeliberationId) -> Result<Vec<Prediction>, StoreError> {
        self.inner.predictions(deliberation)
    }

    fn comments(&self, deliberation: &DeliberationId) -> Result<Vec<Comment>, StoreError> {
        self.inner.comments(deliberation)
    }

    fn comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError> {
        self.inner.comment(id)
    }

    fn user_stats(&self, user: &UserId) -> Result<UserStats, StoreError> {
        self.inner.user_stats(user)
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        self.inner.commit(writes)
    }

    fn commit_if(&self, conditions: &[Condition], writes: WriteSet) -> Result<bool, StoreError> {
        thread::sleep(self.delay);
        self.inner.commit_if(conditions, writes)
    }
}

pub fn member(i: usize) -> UserId {
    UserId::new(format!("member-{i}"))
}

pub fn batch(cell_size: u32) -> DeliberationSettings {
    DeliberationSettings {
        cell_size,
        allocation_mode: AllocationMode::Batch,
        ..DeliberationSettings::default()
    }
}

pub fn fcfs(cell_size: u32) -> DeliberationSettings {
    DeliberationSettings {
        cell_size,
        allocation_mode: AllocationMode::Fcfs,
        ..DeliberationSettings::default()
    }
}

pub fn continuous(cell_size: u32) -> DeliberationSettings {
    DeliberationSettings {
        continuous_flow: true,
        ..fcfs(cell_size)
    }
}
