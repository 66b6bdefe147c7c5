//! The engine facade and deliberation lifecycle operations.
//!
//! [`Engine`] holds no per-deliberation state: everything lives in the
//! [`DeliberationStore`], and every transition that must happen once is a
//! conditional commit. Any number of callers may share one engine (or run
//! separate engines over one store).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tracing::{debug, info, warn};

use chant_core::constants::{
    MAX_CELL_SIZE, MAX_COMMENT_LEN, MAX_IDEA_TEXT_LEN, MAX_QUESTION_LEN, MIN_CELL_SIZE,
};
use chant_core::error::{ChantError, PreconditionError, StoreError};
use chant_core::events::EngineEvent;
use chant_core::store::{Condition, DeliberationStore, Write, WriteSet};
use chant_core::traits::{EventSink, NotificationKind, Notifier};
use chant_core::types::{
    Cell, CellId, CellParticipation, CellStatus, Comment, CommentId, Deliberation,
    DeliberationId, DeliberationSettings, Idea, IdeaId, IdeaStatus, ParticipationStatus, Phase,
    UserId, Vote,
};

use crate::assignment::{next_group_size, plan_idea_groups, PlannedCell};
use crate::cell_result::CellOutcome;
use crate::config::EngineConfig;
use crate::follow_up::FollowUpQueue;

/// Attempts at an optimistic operation before giving up.
pub(crate) const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Result of [`Engine::start_voting`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Voting is open at `tier`. May hold no cells yet under continuous flow.
    Started { tier: u32, cells: Vec<CellId> },
    /// A lone idea was declared champion without a vote.
    ChampionDeclared(IdeaId),
    /// Another caller started (or closed) the deliberation first.
    AlreadyStarted,
}

/// Where [`Engine::enter_cell`] seated a member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Seat {
    pub cell: CellId,
    pub tier: u32,
    /// The cell was created for this entry.
    pub created: bool,
}

/// Result of [`Engine::cast_vote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Ballot replaced an earlier one.
    pub replaced: bool,
    /// Set when this ballot completed the cell.
    pub completion: Option<CellOutcome>,
}

/// The tiered deliberation engine.
pub struct Engine {
    store: Arc<dyn DeliberationStore>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn EventSink>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
    rng: Mutex<StdRng>,
    config: EngineConfig,
    follow_ups: FollowUpQueue,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with the system clock and an entropy-seeded RNG.
    pub fn new(
        store: Arc<dyn DeliberationStore>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(store, notifier, sink, config, system_millis)
    }

    /// Create an engine with a custom millisecond clock.
    pub fn with_clock(
        store: Arc<dyn DeliberationStore>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        let follow_ups = FollowUpQueue::new(config.follow_up_capacity);
        Self {
            store,
            notifier,
            sink,
            clock: Box::new(clock),
            rng: Mutex::new(StdRng::from_entropy()),
            config,
            follow_ups,
        }
    }

    /// Replace the RNG with a seeded one so shuffles and tie draws repeat.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn store(&self) -> &Arc<dyn DeliberationStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        (self.clock)()
    }

    pub(crate) fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock()
    }

    pub(crate) fn follow_ups(&self) -> &FollowUpQueue {
        &self.follow_ups
    }

    // -----------------------------------------------------------------------
    // Side effects: logged, never propagated
    // -----------------------------------------------------------------------

    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.sink.publish(&event) {
            warn!(deliberation = %event.deliberation(), error = %e, "event sink failed");
        }
    }

    pub(crate) fn notify_members(
        &self,
        deliberation: DeliberationId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) {
        if let Err(e) = self.notifier.notify_deliberation_members(deliberation, kind, data) {
            warn!(deliberation = %deliberation, ?kind, error = %e, "member notification failed");
        }
    }

    pub(crate) fn notify_user(&self, user: &UserId, kind: NotificationKind, data: serde_json::Value) {
        if let Err(e) = self.notifier.notify_user(user, kind, data) {
            warn!(user = %user, ?kind, error = %e, "user notification failed");
        }
    }

    /// Emit creation events for freshly committed cells.
    pub(crate) fn announce_cells(&self, cells: &[Cell]) {
        let Some(first) = cells.first() else {
            return;
        };
        for cell in cells {
            self.emit(EngineEvent::CellCreated {
                deliberation: cell.deliberation_id,
                cell: cell.id,
                tier: cell.tier,
                batch: cell.batch,
                ideas: cell.idea_ids.clone(),
            });
        }
        let ids: Vec<String> = cells.iter().map(|c| c.id.to_string()).collect();
        self.notify_members(
            first.deliberation_id,
            NotificationKind::CellReady,
            json!({ "tier": first.tier, "cells": ids }),
        );
    }

    // -----------------------------------------------------------------------
    // Loading helpers
    // -----------------------------------------------------------------------

    pub(crate) fn load(&self, id: DeliberationId) -> Result<Deliberation, ChantError> {
        self.store
            .deliberation(&id)?
            .ok_or_else(|| PreconditionError::DeliberationNotFound(id).into())
    }

    pub(crate) fn load_cell(&self, id: CellId) -> Result<Cell, ChantError> {
        self.store
            .cell(&id)?
            .ok_or_else(|| PreconditionError::CellNotFound(id).into())
    }

    pub(crate) fn load_idea(&self, id: IdeaId) -> Result<Idea, ChantError> {
        self.store
            .idea(&id)?
            .ok_or_else(|| PreconditionError::IdeaNotFound(id).into())
    }

    pub(crate) fn require_member(&self, delib: &Deliberation, user: &UserId) -> Result<(), ChantError> {
        if self.store.members(&delib.id)?.contains(user) {
            Ok(())
        } else {
            Err(PreconditionError::NotAMember(delib.id).into())
        }
    }

    /// Optimistically update a deliberation row.
    ///
    /// `change` returns `false` when nothing needs writing. Retries on
    /// concurrent modification; returns the written row, if any.
    pub(crate) fn update_deliberation(
        &self,
        id: DeliberationId,
        change: impl Fn(&mut Deliberation) -> bool,
    ) -> Result<Option<Deliberation>, ChantError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let current = self.load(id)?;
            let mut next = current.clone();
            if !change(&mut next) {
                return Ok(None);
            }
            let guard = [Condition::DeliberationIs(Box::new(current))];
            if self.store.commit_if(&guard, Write::Deliberation(next.clone()).into())? {
                return Ok(Some(next));
            }
        }
        warn!(deliberation = %id, "gave up updating deliberation under contention");
        Ok(None)
    }

    /// Whether the cell's members are pre-seated (batch allocation).
    pub(crate) fn is_seated(delib: &Deliberation) -> bool {
        !delib.is_fcfs() && !delib.is_continuous()
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Create a deliberation in SUBMISSION. The creator becomes its first member.
    pub fn create_deliberation(
        &self,
        creator: UserId,
        question: &str,
        settings: DeliberationSettings,
    ) -> Result<Deliberation, ChantError> {
        check_text(question, MAX_QUESTION_LEN)?;
        if !(MIN_CELL_SIZE..=MAX_CELL_SIZE).contains(&settings.cell_size()) {
            return Err(PreconditionError::InvalidCellSize(settings.cell_size).into());
        }
        let delib = Deliberation {
            id: DeliberationId(self.store.next_id()?),
            question: question.trim().to_string(),
            creator: creator.clone(),
            settings,
            phase: Phase::Submission,
            current_tier: 0,
            round_start_tier: 1,
            challenge_round: 0,
            champion_id: None,
            champion_entered_tier: None,
            accumulation_ends_at: None,
            submissions_closed: false,
            created_at: self.now(),
        };
        let mut writes = WriteSet::new();
        writes
            .push(Write::Deliberation(delib.clone()))
            .push(Write::Member {
                deliberation: delib.id,
                user: creator.clone(),
            });
        self.store.commit(writes)?;

        info!(deliberation = %delib.id, cell_size = delib.settings.cell_size, "deliberation created");
        self.emit(EngineEvent::DeliberationCreated {
            deliberation: delib.id,
            creator,
            cell_size: delib.settings.cell_size,
        });
        Ok(delib)
    }

    /// Add a member. Idempotent.
    pub fn join(&self, deliberation: DeliberationId, user: UserId) -> Result<(), ChantError> {
        self.load(deliberation)?;
        self.store.commit(
            Write::Member {
                deliberation,
                user,
            }
            .into(),
        )?;
        Ok(())
    }

    /// Submit an idea.
    ///
    /// Accepted during SUBMISSION, during VOTING of a continuous-flow
    /// deliberation until submissions close, and during ACCUMULATING as a
    /// PENDING challenger.
    pub fn submit_idea(
        &self,
        deliberation: DeliberationId,
        author: Option<UserId>,
        text: &str,
    ) -> Result<Idea, ChantError> {
        check_text(text, MAX_IDEA_TEXT_LEN)?;
        let delib = self.load(deliberation)?;
        if let Some(author) = &author {
            self.require_member(&delib, author)?;
        }
        let status = match delib.phase {
            Phase::Submission => IdeaStatus::Submitted,
            Phase::Voting if delib.is_continuous() => {
                if delib.submissions_closed {
                    return Err(PreconditionError::SubmissionsClosed.into());
                }
                IdeaStatus::Submitted
            }
            Phase::Accumulating => IdeaStatus::Pending,
            actual => {
                return Err(PreconditionError::WrongPhase {
                    expected: Phase::Submission,
                    actual,
                }
                .into());
            }
        };
        let idea = Idea {
            id: IdeaId(self.store.next_id()?),
            deliberation_id: deliberation,
            text: text.trim().to_string(),
            author: author.clone(),
            status,
            tier: 0,
            total_xp: 0,
            losses: 0,
            is_champion: false,
            created_at: self.now(),
        };
        let guard = [Condition::DeliberationPhase {
            id: deliberation,
            phase: delib.phase,
        }];
        if !self.store.commit_if(&guard, Write::Idea(idea.clone()).into())? {
            let actual = self.load(deliberation)?.phase;
            return Err(PreconditionError::WrongPhase {
                expected: delib.phase,
                actual,
            }
            .into());
        }

        debug!(deliberation = %deliberation, idea = %idea.id, %status, "idea submitted");
        self.emit(EngineEvent::IdeaSubmitted {
            deliberation,
            idea: idea.id,
            author,
            challenger: status == IdeaStatus::Pending,
        });
        if delib.phase == Phase::Voting {
            let outcome = self.form_entry_cells(deliberation)?;
            debug!(deliberation = %deliberation, ?outcome, "entry formation after submission");
        }
        Ok(idea)
    }

    /// Open voting: build tier-1 cells, or crown a lone idea.
    pub fn start_voting(&self, deliberation: DeliberationId) -> Result<StartOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        if delib.phase != Phase::Submission {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Submission,
                actual: delib.phase,
            }
            .into());
        }
        let ideas: Vec<Idea> = self
            .store
            .ideas(&deliberation)?
            .into_iter()
            .filter(|i| i.status == IdeaStatus::Submitted)
            .collect();
        let guard = Condition::DeliberationPhase {
            id: deliberation,
            phase: Phase::Submission,
        };
        match ideas.as_slice() {
            [] => return Err(PreconditionError::NoIdeas.into()),
            [only] => {
                info!(deliberation = %deliberation, idea = %only.id, "single idea, skipping voting");
                return Ok(if self.declare_champion(&delib, only.clone(), guard)? {
                    StartOutcome::ChampionDeclared(only.id)
                } else {
                    StartOutcome::AlreadyStarted
                });
            }
            _ => {}
        }

        let seated = Self::is_seated(&delib);
        let members = self.store.members(&deliberation)?;
        if seated && members.len() < self.config.min_batch_members {
            return Err(PreconditionError::InsufficientParticipants {
                have: members.len(),
                need: self.config.min_batch_members,
            }
            .into());
        }

        let tier = 1;
        let plans = self.plan_round(&delib, &ideas, &members);
        let mut next = delib.clone();
        next.phase = delib.phase.transition(Phase::Voting)?;
        next.current_tier = tier;
        next.round_start_tier = tier;

        let new = self.materialize(&next, tier, plans, &ideas, self.now())?;
        let mut writes = new.writes;
        writes.push(Write::Deliberation(next));
        if !self.store.commit_if(&[guard], writes)? {
            debug!(deliberation = %deliberation, "voting already started elsewhere");
            return Ok(StartOutcome::AlreadyStarted);
        }

        info!(deliberation = %deliberation, ideas = ideas.len(), cells = new.cells.len(), "voting started");
        self.emit(EngineEvent::PhaseChanged {
            deliberation,
            from: Phase::Submission,
            to: Phase::Voting,
        });
        self.announce_cells(&new.cells);
        self.notify_members(deliberation, NotificationKind::VotingStarted, json!({ "tier": tier }));
        Ok(StartOutcome::Started {
            tier,
            cells: new.cells.iter().map(|c| c.id).collect(),
        })
    }

    /// Plan the opening cells of a round from its `ideas`.
    pub(crate) fn plan_round(
        &self,
        delib: &Deliberation,
        ideas: &[Idea],
        members: &[UserId],
    ) -> Vec<PlannedCell> {
        let seated = Self::is_seated(delib);
        if delib.settings.single_cell {
            let mut ids: Vec<IdeaId> = ideas.iter().map(|i| i.id).collect();
            ids.sort();
            return vec![PlannedCell {
                ideas: ids,
                members: if seated { members.to_vec() } else { Vec::new() },
                batch: Some(0),
            }];
        }
        if seated {
            return self.plan_seated(ideas, members, delib.cell_size());
        }
        let mut ids: Vec<IdeaId> = ideas.iter().map(|i| i.id).collect();
        self.shuffle(&mut ids);
        plan_idea_groups(&ids, delib.cell_size(), delib.is_continuous())
            .into_iter()
            .map(|ideas| PlannedCell {
                ideas,
                members: Vec::new(),
                batch: None,
            })
            .collect()
    }

    /// Self-assign a member to a cell (FCFS and continuous flow).
    ///
    /// Fills the fullest open cell with room, avoiding cells holding the
    /// member's own idea when possible. With no room anywhere, FCFS creates
    /// the next cell from ideas waiting at the current tier and continuous
    /// flow opens another cell of a final showdown. For pre-seated
    /// deliberations this returns the member's open seat.
    pub fn enter_cell(&self, deliberation: DeliberationId, user: UserId) -> Result<Seat, ChantError> {
        let delib = self.load(deliberation)?;
        self.require_member(&delib, &user)?;
        if delib.phase != Phase::Voting {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Voting,
                actual: delib.phase,
            }
            .into());
        }

        if Self::is_seated(&delib) {
            for cell in self.store.cells(&deliberation)? {
                if cell.status.is_open()
                    && self
                        .store
                        .participants(&cell.id)?
                        .iter()
                        .any(|p| p.user_id == user)
                {
                    return Ok(Seat {
                        cell: cell.id,
                        tier: cell.tier,
                        created: false,
                    });
                }
            }
            return Err(PreconditionError::NoOpenCell.into());
        }

        let cs = delib.cell_size();
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let delib = self.load(deliberation)?;
            let cells = self.store.cells(&deliberation)?;
            let ideas = self.store.ideas(&deliberation)?;
            let authored: Vec<IdeaId> = ideas
                .iter()
                .filter(|i| i.author.as_ref() == Some(&user))
                .map(|i| i.id)
                .collect();

            let mut seated_tiers = Vec::new();
            let mut candidates = Vec::new();
            let mut full_showdowns = Vec::new();
            for cell in &cells {
                let participants = self.store.participants(&cell.id)?;
                if participants.iter().any(|p| p.user_id == user) {
                    if cell.status.is_open() {
                        return Err(PreconditionError::AlreadySeated(cell.id).into());
                    }
                    seated_tiers.push(cell.tier);
                    continue;
                }
                if !cell.status.is_open() {
                    continue;
                }
                if participants.len() < cs {
                    candidates.push((cell, participants.len()));
                } else if cell.batch.is_some() {
                    full_showdowns.push(cell);
                }
            }
            candidates.retain(|(c, _)| !seated_tiers.contains(&c.tier));
            full_showdowns.retain(|c| !seated_tiers.contains(&c.tier));

            let pick = candidates.iter().min_by_key(|(cell, seated)| {
                let conflict = cell.idea_ids.iter().any(|i| authored.contains(i));
                (conflict, std::cmp::Reverse(cell.tier), std::cmp::Reverse(*seated), cell.id)
            });
            if let Some((cell, _)) = pick {
                let guard = [
                    Condition::CellNotCompleted(cell.id),
                    Condition::SeatsBelow {
                        cell: cell.id,
                        limit: cs,
                    },
                ];
                let seat = self.participation(cell, &user);
                if self.store.commit_if(&guard, Write::Participation(seat).into())? {
                    debug!(cell = %cell.id, user = %user, "member entered cell");
                    return Ok(Seat {
                        cell: cell.id,
                        tier: cell.tier,
                        created: false,
                    });
                }
                continue;
            }

            if delib.is_continuous() {
                let Some(showdown) = full_showdowns.first() else {
                    break;
                };
                if let Some(seat) = self.open_showdown_sibling(&delib, showdown, &user)? {
                    return Ok(seat);
                }
                continue;
            }

            let tier = delib.current_tier;
            if seated_tiers.contains(&tier) || tier <= delib.round_start_tier {
                break;
            }
            let waiting: Vec<IdeaId> = ideas
                .iter()
                .filter(|i| i.status == IdeaStatus::Advancing && i.tier + 1 == tier)
                .map(|i| i.id)
                .collect();
            let take = next_group_size(waiting.len(), cs);
            if take == 0 {
                break;
            }
            if let Some(seat) = self.open_on_demand(&delib, &waiting[..take], &user)? {
                return Ok(seat);
            }
        }
        Err(PreconditionError::NoOpenCell.into())
    }

    fn participation(&self, cell: &Cell, user: &UserId) -> CellParticipation {
        CellParticipation {
            cell_id: cell.id,
            deliberation_id: cell.deliberation_id,
            user_id: user.clone(),
            status: ParticipationStatus::Active,
            joined_at: self.now(),
        }
    }

    /// Claim a waiting group for the current tier and seat `user` in a new cell.
    fn open_on_demand(
        &self,
        delib: &Deliberation,
        group: &[IdeaId],
        user: &UserId,
    ) -> Result<Option<Seat>, ChantError> {
        let tier = delib.current_tier;
        let Some(cell) = self.claim_and_open(
            delib,
            group,
            IdeaStatus::Advancing,
            tier - 1,
            tier,
            None,
        )?
        else {
            return Ok(None);
        };
        let seat = self.participation(&cell, user);
        self.store.commit(Write::Participation(seat).into())?;
        Ok(Some(Seat {
            cell: cell.id,
            tier,
            created: true,
        }))
    }

    /// Open another cell over a full showdown's idea set.
    fn open_showdown_sibling(
        &self,
        delib: &Deliberation,
        showdown: &Cell,
        user: &UserId,
    ) -> Result<Option<Seat>, ChantError> {
        let cell = self.open_cell(
            delib,
            showdown.tier,
            showdown.batch,
            showdown.idea_ids.clone(),
            self.now(),
        )?;
        let mut writes = WriteSet::new();
        writes
            .push(Write::Cell(cell.clone()))
            .push(Write::Participation(self.participation(&cell, user)));
        if !self
            .store
            .commit_if(&[Condition::CellNotCompleted(showdown.id)], writes)?
        {
            return Ok(None);
        }
        info!(deliberation = %delib.id, cell = %cell.id, sibling = %showdown.id, "showdown cell added");
        self.announce_cells(std::slice::from_ref(&cell));
        Ok(Some(Seat {
            cell: cell.id,
            tier: cell.tier,
            created: true,
        }))
    }

    /// Cast (or replace) a ballot distributing exactly the configured points.
    ///
    /// Completes the cell when every seated member has voted (pre-seated
    /// cells) or when `cell_size` distinct members have voted (self-assigned
    /// cells).
    pub fn cast_vote(
        &self,
        cell_id: CellId,
        user: UserId,
        allocations: &[(IdeaId, u32)],
    ) -> Result<VoteOutcome, ChantError> {
        let cell = self.load_cell(cell_id)?;
        match cell.status {
            CellStatus::Completed => return Err(PreconditionError::CellClosed(cell_id).into()),
            CellStatus::Deliberating => return Err(PreconditionError::VotingNotOpen(cell_id).into()),
            CellStatus::Voting => {}
        }
        let participants = self.store.participants(&cell_id)?;
        let Some(seat) = participants.iter().find(|p| p.user_id == user) else {
            return Err(PreconditionError::NotSeated(cell_id).into());
        };

        let mut points: BTreeMap<IdeaId, u32> = BTreeMap::new();
        for (idea, xp) in allocations {
            if !cell.contains(idea) {
                return Err(PreconditionError::IdeaNotInCell {
                    idea: *idea,
                    cell: cell_id,
                }
                .into());
            }
            let entry = points.entry(*idea).or_default();
            *entry = entry.saturating_add(*xp);
        }
        points.retain(|_, xp| *xp > 0);
        let total = points.values().fold(0u32, |acc, xp| acc.saturating_add(*xp));
        if total != self.config.vote_points {
            return Err(PreconditionError::InvalidPointTotal {
                got: total,
                expected: self.config.vote_points,
            }
            .into());
        }

        let now = self.now();
        let replaced = seat.status == ParticipationStatus::Voted;
        let mut writes = WriteSet::new();
        writes.push(Write::ClearBallot {
            cell: cell_id,
            user: user.clone(),
        });
        for (idea, xp) in &points {
            writes.push(Write::Vote(Vote {
                cell_id,
                deliberation_id: cell.deliberation_id,
                user_id: user.clone(),
                idea_id: *idea,
                xp_points: *xp,
                cast_at: now,
            }));
        }
        let mut voted = seat.clone();
        voted.status = ParticipationStatus::Voted;
        writes.push(Write::Participation(voted));
        let guard = [Condition::CellStatusIs {
            id: cell_id,
            status: CellStatus::Voting,
        }];
        if !self.store.commit_if(&guard, writes)? {
            return Err(PreconditionError::CellClosed(cell_id).into());
        }

        debug!(cell = %cell_id, user = %user, replaced, "ballot cast");
        self.emit(EngineEvent::VoteCast {
            deliberation: cell.deliberation_id,
            cell: cell_id,
            user,
        });

        let delib = self.load(cell.deliberation_id)?;
        let participants = self.store.participants(&cell_id)?;
        let voted = participants
            .iter()
            .filter(|p| p.status == ParticipationStatus::Voted)
            .count();
        let required = if Self::is_seated(&delib) {
            participants.len()
        } else {
            delib.cell_size()
        };
        let completion = if voted > 0 && voted >= required {
            Some(self.process_cell_results(cell_id, false)?)
        } else {
            None
        };
        Ok(VoteOutcome {
            replaced,
            completion,
        })
    }

    /// Facilitator override: complete a cell now, whatever its votes.
    pub fn force_complete_cell(&self, cell: CellId) -> Result<CellOutcome, ChantError> {
        info!(cell = %cell, "facilitator forcing cell completion");
        self.process_cell_results(cell, false)
    }

    /// Post a comment in a cell the author sits in.
    pub fn add_comment(
        &self,
        cell_id: CellId,
        author: UserId,
        text: &str,
        idea: Option<IdeaId>,
    ) -> Result<Comment, ChantError> {
        check_text(text, MAX_COMMENT_LEN)?;
        let cell = self.load_cell(cell_id)?;
        if !self
            .store
            .participants(&cell_id)?
            .iter()
            .any(|p| p.user_id == author)
        {
            return Err(PreconditionError::NotSeated(cell_id).into());
        }
        if let Some(idea) = idea {
            if !cell.contains(&idea) {
                return Err(PreconditionError::IdeaNotInCell { idea, cell: cell_id }.into());
            }
        }
        let comment = Comment {
            id: CommentId(self.store.next_id()?),
            deliberation_id: cell.deliberation_id,
            cell_id,
            idea_id: idea,
            author,
            text: text.trim().to_string(),
            upvote_count: 0,
            spread_count: 0,
            reach_tier: cell.tier,
            created_at: self.now(),
        };
        self.store.commit(Write::Comment(comment.clone()).into())?;
        Ok(comment)
    }

    /// Add one upvote. Concurrent upvotes each land.
    pub fn upvote_comment(&self, id: CommentId) -> Result<Comment, ChantError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let current = self
                .store
                .comment(&id)?
                .ok_or(PreconditionError::CommentNotFound(id))?;
            let mut next = current.clone();
            next.upvote_count += 1;
            let guard = [Condition::CommentIs(Box::new(current))];
            if self.store.commit_if(&guard, Write::Comment(next.clone()).into())? {
                return Ok(next);
            }
        }
        warn!(comment = %id, "gave up upvoting under contention");
        Err(StoreError::Backend(format!("upvote on {id} kept losing to concurrent writers")).into())
    }
}

fn check_text(text: &str, max: usize) -> Result<(), PreconditionError> {
    let text = text.trim();
    if text.is_empty() {
        Err(PreconditionError::EmptyText)
    } else if text.len() > max {
        Err(PreconditionError::TextTooLong {
            len: text.len(),
            max,
        })
    } else {
        Ok(())
    }
}

fn system_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
