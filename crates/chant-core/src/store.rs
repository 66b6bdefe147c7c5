//! Persistence contract and in-memory implementation.
//!
//! The engine never takes a lock on a deliberation. Every transition that
//! must happen exactly once (cell completion, tier advance, idea claiming)
//! is a [`DeliberationStore::commit_if`]: the write set is applied only when
//! every [`Condition`] still holds, atomically with respect to other commits.
//! A `false` return means another caller won the race.
//!
//! [`MemoryStore`] is suitable for tests and embedding; the node crate
//! provides a RocksDB-backed store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::{
    Cell, CellId, CellParticipation, CellStatus, Comment, CommentId, Deliberation,
    DeliberationId, Idea, IdeaId, IdeaStatus, Phase, Prediction, PredictionId, UserId, UserStats,
    Vote,
};

/// A single row write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Deliberation(Deliberation),
    Idea(Idea),
    Cell(Cell),
    Member { deliberation: DeliberationId, user: UserId },
    Participation(CellParticipation),
    Vote(Vote),
    /// Remove every vote `user` holds in `cell` (ballot replacement).
    ClearBallot { cell: CellId, user: UserId },
    Prediction(Prediction),
    Comment(Comment),
    UserStats(UserStats),
}

/// An ordered list of writes applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSet {
    writes: Vec<Write>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn extend(&mut self, other: WriteSet) {
        self.writes.extend(other.writes);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Write> {
        self.writes.iter()
    }
}

impl IntoIterator for WriteSet {
    type Item = Write;
    type IntoIter = std::vec::IntoIter<Write>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

impl From<Write> for WriteSet {
    fn from(write: Write) -> Self {
        Self {
            writes: vec![write],
        }
    }
}

/// Guard evaluated under the store's commit serialisation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Deliberation is in `phase` at `tier`.
    DeliberationAt {
        id: DeliberationId,
        phase: Phase,
        tier: u32,
    },
    DeliberationPhase { id: DeliberationId, phase: Phase },
    /// The deliberation row still equals this snapshot (optimistic update).
    DeliberationIs(Box<Deliberation>),
    CellStatusIs { id: CellId, status: CellStatus },
    CellNotCompleted(CellId),
    /// The cell's one-time timeout extension has not been used.
    CellNotExtended(CellId),
    IdeaStatusIs { id: IdeaId, status: IdeaStatus },
    /// Idea is in `status` at `tier`.
    IdeaAt {
        id: IdeaId,
        status: IdeaStatus,
        tier: u32,
    },
    /// Fewer than `limit` members are seated in the cell.
    SeatsBelow { cell: CellId, limit: usize },
    PredictionIs(Box<Prediction>),
    /// Stats row equals this snapshot; a user with no row matches zeroed stats.
    UserStatsIs(Box<UserStats>),
    CommentIs(Box<Comment>),
}

/// Point lookups needed to evaluate [`Condition`]s.
pub trait RowLookup {
    fn lookup_deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError>;
    fn lookup_cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError>;
    fn lookup_idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError>;
    fn participant_count(&self, cell: &CellId) -> Result<usize, StoreError>;
    fn lookup_prediction(&self, id: &PredictionId) -> Result<Option<Prediction>, StoreError>;
    fn lookup_comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError>;
    fn lookup_user_stats(&self, user: &UserId) -> Result<UserStats, StoreError>;
}

impl Condition {
    /// Evaluate against current rows. A missing row never satisfies a condition.
    pub fn holds<R: RowLookup + ?Sized>(&self, rows: &R) -> Result<bool, StoreError> {
        Ok(match self {
            Self::DeliberationAt { id, phase, tier } => rows
                .lookup_deliberation(id)?
                .is_some_and(|d| d.phase == *phase && d.current_tier == *tier),
            Self::DeliberationPhase { id, phase } => rows
                .lookup_deliberation(id)?
                .is_some_and(|d| d.phase == *phase),
            Self::DeliberationIs(snapshot) => rows
                .lookup_deliberation(&snapshot.id)?
                .is_some_and(|d| d == **snapshot),
            Self::CellStatusIs { id, status } => {
                rows.lookup_cell(id)?.is_some_and(|c| c.status == *status)
            }
            Self::CellNotCompleted(id) => rows
                .lookup_cell(id)?
                .is_some_and(|c| c.status != CellStatus::Completed),
            Self::CellNotExtended(id) => rows
                .lookup_cell(id)?
                .is_some_and(|c| !c.completed_by_timeout),
            Self::IdeaStatusIs { id, status } => {
                rows.lookup_idea(id)?.is_some_and(|i| i.status == *status)
            }
            Self::IdeaAt { id, status, tier } => rows
                .lookup_idea(id)?
                .is_some_and(|i| i.status == *status && i.tier == *tier),
            Self::SeatsBelow { cell, limit } => {
                rows.lookup_cell(cell)?.is_some() && rows.participant_count(cell)? < *limit
            }
            Self::PredictionIs(snapshot) => rows
                .lookup_prediction(&snapshot.id)?
                .is_some_and(|p| p == **snapshot),
            Self::UserStatsIs(snapshot) => rows.lookup_user_stats(&snapshot.user_id)? == **snapshot,
            Self::CommentIs(snapshot) => rows
                .lookup_comment(&snapshot.id)?
                .is_some_and(|c| c == **snapshot),
        })
    }
}

/// Evaluate every condition; `true` only if all hold.
pub fn all_hold<R: RowLookup + ?Sized>(
    conditions: &[Condition],
    rows: &R,
) -> Result<bool, StoreError> {
    for condition in conditions {
        if !condition.holds(rows)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Relational store for deliberation state.
///
/// Read methods return rows sorted by id. Writes go through [`commit`] or
/// [`commit_if`], both atomic.
///
/// [`commit`]: DeliberationStore::commit
/// [`commit_if`]: DeliberationStore::commit_if
pub trait DeliberationStore: Send + Sync {
    /// Allocate a fresh, monotonically increasing identifier.
    fn next_id(&self) -> Result<u64, StoreError>;

    fn deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError>;

    fn deliberation_ids(&self) -> Result<Vec<DeliberationId>, StoreError>;

    fn idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError>;

    fn ideas(&self, deliberation: &DeliberationId) -> Result<Vec<Idea>, StoreError>;

    fn cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError>;

    fn cells(&self, deliberation: &DeliberationId) -> Result<Vec<Cell>, StoreError>;

    /// Cells of one tier. Default implementation filters [`cells`](Self::cells).
    fn cells_at_tier(
        &self,
        deliberation: &DeliberationId,
        tier: u32,
    ) -> Result<Vec<Cell>, StoreError> {
        Ok(self
            .cells(deliberation)?
            .into_iter()
            .filter(|c| c.tier == tier)
            .collect())
    }

    fn members(&self, deliberation: &DeliberationId) -> Result<Vec<UserId>, StoreError>;

    fn participants(&self, cell: &CellId) -> Result<Vec<CellParticipation>, StoreError>;

    fn votes(&self, cell: &CellId) -> Result<Vec<Vote>, StoreError>;

    fn predictions(&self, deliberation: &DeliberationId) -> Result<Vec<Prediction>, StoreError>;

    fn comments(&self, deliberation: &DeliberationId) -> Result<Vec<Comment>, StoreError>;

    fn comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError>;

    /// Stats for a user; zeroed stats if none were recorded yet.
    fn user_stats(&self, user: &UserId) -> Result<UserStats, StoreError>;

    /// Apply all writes atomically.
    fn commit(&self, writes: WriteSet) -> Result<(), StoreError>;

    /// Apply all writes atomically if every condition holds.
    ///
    /// Returns `false` (and writes nothing) when any condition fails.
    fn commit_if(&self, conditions: &[Condition], writes: WriteSet) -> Result<bool, StoreError>;

    /// Row-by-row conditional status update, like `UPDATE .. WHERE status = from`.
    ///
    /// Each idea still in `from` moves to `to` at `tier`. Returns the ids that
    /// actually moved; the caller decides what to do with a partial result.
    /// Edges are not validated here. Claims that must take a whole group or
    /// nothing belong in one [`commit_if`](Self::commit_if) instead.
    fn transition_ideas(
        &self,
        ids: &[IdeaId],
        from: IdeaStatus,
        to: IdeaStatus,
        tier: u32,
    ) -> Result<Vec<IdeaId>, StoreError> {
        let mut moved = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut idea) = self.idea(id)? else {
                continue;
            };
            if idea.status != from {
                continue;
            }
            let guard = [Condition::IdeaAt {
                id: *id,
                status: from,
                tier: idea.tier,
            }];
            idea.status = to;
            idea.tier = tier;
            if self.commit_if(&guard, Write::Idea(idea).into())? {
                moved.push(*id);
            }
        }
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    deliberations: BTreeMap<DeliberationId, Deliberation>,
    ideas: BTreeMap<IdeaId, Idea>,
    cells: BTreeMap<CellId, Cell>,
    members: BTreeMap<DeliberationId, BTreeSet<UserId>>,
    participations: BTreeMap<(CellId, UserId), CellParticipation>,
    votes: BTreeMap<(CellId, UserId, IdeaId), Vote>,
    predictions: BTreeMap<PredictionId, Prediction>,
    comments: BTreeMap<CommentId, Comment>,
    user_stats: HashMap<UserId, UserStats>,
}

impl Tables {
    fn apply(&mut self, write: Write) {
        match write {
            Write::Deliberation(d) => {
                self.deliberations.insert(d.id, d);
            }
            Write::Idea(i) => {
                self.ideas.insert(i.id, i);
            }
            Write::Cell(c) => {
                self.cells.insert(c.id, c);
            }
            Write::Member { deliberation, user } => {
                self.members.entry(deliberation).or_default().insert(user);
            }
            Write::Participation(p) => {
                self.participations.insert((p.cell_id, p.user_id.clone()), p);
            }
            Write::Vote(v) => {
                self.votes
                    .insert((v.cell_id, v.user_id.clone(), v.idea_id), v);
            }
            Write::ClearBallot { cell, user } => {
                self.votes
                    .retain(|(c, u, _), _| !(*c == cell && *u == user));
            }
            Write::Prediction(p) => {
                self.predictions.insert(p.id, p);
            }
            Write::Comment(c) => {
                self.comments.insert(c.id, c);
            }
            Write::UserStats(s) => {
                self.user_stats.insert(s.user_id.clone(), s);
            }
        }
    }
}

impl RowLookup for Tables {
    fn lookup_deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError> {
        Ok(self.deliberations.get(id).cloned())
    }

    fn lookup_cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError> {
        Ok(self.cells.get(id).cloned())
    }

    fn lookup_idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError> {
        Ok(self.ideas.get(id).cloned())
    }

    fn participant_count(&self, cell: &CellId) -> Result<usize, StoreError> {
        Ok(self
            .participations
            .range((*cell, UserId::default())..)
            .take_while(|((c, _), _)| c == cell)
            .count())
    }

    fn lookup_prediction(&self, id: &PredictionId) -> Result<Option<Prediction>, StoreError> {
        Ok(self.predictions.get(id).cloned())
    }

    fn lookup_comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError> {
        Ok(self.comments.get(id).cloned())
    }

    fn lookup_user_stats(&self, user: &UserId) -> Result<UserStats, StoreError> {
        Ok(self
            .user_stats
            .get(user)
            .cloned()
            .unwrap_or_else(|| UserStats::new(user.clone())))
    }
}

/// In-memory store backed by ordered maps behind a read-write lock.
///
/// No persistence and unbounded growth: for tests and embedding only.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of cells across every deliberation.
    pub fn cell_count(&self) -> usize {
        self.tables.read().cells.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliberationStore for MemoryStore {
    fn next_id(&self) -> Result<u64, StoreError> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError> {
        self.tables.read().lookup_deliberation(id)
    }

    fn deliberation_ids(&self) -> Result<Vec<DeliberationId>, StoreError> {
        Ok(self.tables.read().deliberations.keys().copied().collect())
    }

    fn idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError> {
        self.tables.read().lookup_idea(id)
    }

    fn ideas(&self, deliberation: &DeliberationId) -> Result<Vec<Idea>, StoreError> {
        Ok(self
            .tables
            .read()
            .ideas
            .values()
            .filter(|i| i.deliberation_id == *deliberation)
            .cloned()
            .collect())
    }

    fn cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError> {
        self.tables.read().lookup_cell(id)
    }

    fn cells(&self, deliberation: &DeliberationId) -> Result<Vec<Cell>, StoreError> {
        Ok(self
            .tables
            .read()
            .cells
            .values()
            .filter(|c| c.deliberation_id == *deliberation)
            .cloned()
            .collect())
    }

    fn members(&self, deliberation: &DeliberationId) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .tables
            .read()
            .members
            .get(deliberation)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn participants(&self, cell: &CellId) -> Result<Vec<CellParticipation>, StoreError> {
        Ok(self
            .tables
            .read()
            .participations
            .iter()
            .filter(|((c, _), _)| c == cell)
            .map(|(_, p)| p.clone())
            .collect())
    }

    fn votes(&self, cell: &CellId) -> Result<Vec<Vote>, StoreError> {
        Ok(self
            .tables
            .read()
            .votes
            .iter()
            .filter(|((c, _, _), _)| c == cell)
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn predictions(&self, deliberation: &DeliberationId) -> Result<Vec<Prediction>, StoreError> {
        Ok(self
            .tables
            .read()
            .predictions
            .values()
            .filter(|p| p.deliberation_id == *deliberation)
            .cloned()
            .collect())
    }

    fn comments(&self, deliberation: &DeliberationId) -> Result<Vec<Comment>, StoreError> {
        Ok(self
            .tables
            .read()
            .comments
            .values()
            .filter(|c| c.deliberation_id == *deliberation)
            .cloned()
            .collect())
    }

    fn comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError> {
        self.tables.read().lookup_comment(id)
    }

    fn user_stats(&self, user: &UserId) -> Result<UserStats, StoreError> {
        self.tables.read().lookup_user_stats(user)
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for write in writes {
            tables.apply(write);
        }
        Ok(())
    }

    fn commit_if(&self, conditions: &[Condition], writes: WriteSet) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if !all_hold(conditions, &*tables)? {
            return Ok(false);
        }
        for write in writes {
            tables.apply(write);
        }
        Ok(true)
    }
}
