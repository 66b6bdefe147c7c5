//! Cell planning.
//!
//! Two strategies, fixed per deliberation:
//!
//! - **Seated** (batch allocation): the member count fixes the number of
//!   cells via [`calculate_cell_sizes`]; ideas flex to fit. Members are
//!   seated up front, steering authors away from their own ideas.
//! - **Idea-only** (FCFS and continuous flow): cells hold ideas and no
//!   members; members self-assign through [`Engine::enter_cell`].
//!
//! The planners are pure given a pre-shuffled input; shuffling happens here
//! with the engine's RNG, so tests can seed it.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::Rng;

use chant_core::constants::{MIN_CELL_SIZE, NO_TIMER};
use chant_core::error::ChantError;
use chant_core::sizing::{calculate_cell_sizes, calculate_idea_sizes, idea_group_count};
use chant_core::store::{Write, WriteSet};
use chant_core::types::{
    Cell, CellId, CellParticipation, CellStatus, Deliberation, Idea, IdeaId, IdeaStatus,
    ParticipationStatus, UserId,
};

use crate::engine::Engine;

/// A cell before it has an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedCell {
    /// Sorted.
    pub ideas: Vec<IdeaId>,
    /// Empty for idea-only cells.
    pub members: Vec<UserId>,
    pub batch: Option<u32>,
}

/// Plan pre-seated cells for one tier.
///
/// Cell count follows the member count; ideas are split into
/// `min(cells, ceil(ideas / cell_size))` groups and cells sharing a group
/// form a batch. Returns no cells when either input is empty.
pub fn plan_seated_tier<R: Rng + ?Sized>(
    ideas: &[Idea],
    members: &[UserId],
    cell_size: usize,
    rng: &mut R,
) -> Vec<PlannedCell> {
    if ideas.is_empty() || members.is_empty() {
        return Vec::new();
    }
    let mut ideas: Vec<&Idea> = ideas.iter().collect();
    let mut members = members.to_vec();
    ideas.shuffle(rng);
    members.shuffle(rng);

    let capacities = calculate_cell_sizes(members.len(), cell_size);
    let group_count = idea_group_count(ideas.len(), capacities.len(), cell_size);
    let mut groups: Vec<Vec<&Idea>> = Vec::with_capacity(group_count);
    let mut rest = ideas.as_slice();
    for size in calculate_idea_sizes(ideas.len(), group_count) {
        let (head, tail) = rest.split_at(size);
        groups.push(head.to_vec());
        rest = tail;
    }

    // Consecutive cells share a group; the first groups take the extra cells.
    let cells_per_group = calculate_idea_sizes(capacities.len(), group_count);
    let cell_group: Vec<usize> = cells_per_group
        .iter()
        .enumerate()
        .flat_map(|(g, n)| std::iter::repeat_n(g, *n))
        .collect();

    let mut conflicts: HashMap<UserId, BTreeSet<usize>> = HashMap::new();
    for (cell, group) in cell_group.iter().enumerate() {
        for idea in &groups[*group] {
            if let Some(author) = &idea.author {
                conflicts.entry(author.clone()).or_default().insert(cell);
            }
        }
    }

    let seats = seat_members(&members, &capacities, &conflicts);
    cell_group
        .iter()
        .zip(seats)
        .map(|(group, members)| {
            let mut ideas: Vec<IdeaId> = groups[*group].iter().map(|i| i.id).collect();
            ideas.sort();
            PlannedCell {
                ideas,
                members,
                batch: (cells_per_group[*group] > 1).then_some(*group as u32),
            }
        })
        .collect()
}

/// Seat members into cells of the given capacities.
///
/// Each member goes to the cell that is below [`MIN_CELL_SIZE`] (first) and
/// least full (second), skipping cells that contain one of their own ideas.
/// If every conflict-free cell is full, the conflict rule is dropped.
/// Members with the most conflicting cells are seated first.
pub fn seat_members(
    members: &[UserId],
    capacities: &[usize],
    conflicts: &HashMap<UserId, BTreeSet<usize>>,
) -> Vec<Vec<UserId>> {
    let mut order: Vec<&UserId> = members.iter().collect();
    order.sort_by_key(|m| Reverse(conflicts.get(*m).map_or(0, BTreeSet::len)));

    let mut seats: Vec<Vec<UserId>> = vec![Vec::new(); capacities.len()];
    for member in order {
        let own = conflicts.get(member);
        let pick = best_cell(&seats, capacities, |i| !own.is_some_and(|c| c.contains(&i)))
            .or_else(|| best_cell(&seats, capacities, |_| true));
        match pick {
            Some(i) => seats[i].push(member.clone()),
            None => {
                // Capacities always sum to the member count; overflow joins the smallest cell.
                if let Some(smallest) = seats.iter_mut().min_by_key(|s| s.len()) {
                    smallest.push(member.clone());
                }
            }
        }
    }
    seats
}

fn best_cell(
    seats: &[Vec<UserId>],
    capacities: &[usize],
    allowed: impl Fn(usize) -> bool,
) -> Option<usize> {
    (0..seats.len())
        .filter(|i| seats[*i].len() < capacities[*i] && allowed(*i))
        .min_by_key(|i| (seats[*i].len() >= MIN_CELL_SIZE, seats[*i].len(), *i))
}

/// Split ideas into idea-only groups.
///
/// With `full_only`, only complete groups of `cell_size` are returned and
/// the remainder is left out. Otherwise the ideas are spread evenly over
/// `max(1, ideas / cell_size)` groups, so no group is smaller than the
/// target unless there are fewer ideas than one group.
pub fn plan_idea_groups(ideas: &[IdeaId], cell_size: usize, full_only: bool) -> Vec<Vec<IdeaId>> {
    let size = cell_size.max(1);
    if full_only {
        return ideas.chunks_exact(size).map(sorted).collect();
    }
    if ideas.is_empty() {
        return Vec::new();
    }
    let mut rest = ideas;
    calculate_idea_sizes(ideas.len(), (ideas.len() / size).max(1))
        .into_iter()
        .map(|n| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            sorted(head)
        })
        .collect()
}

/// Size of the next on-demand group drawn from `waiting` ideas.
pub fn next_group_size(waiting: usize, cell_size: usize) -> usize {
    plan_group_sizes(waiting, cell_size).first().copied().unwrap_or(0)
}

fn plan_group_sizes(waiting: usize, cell_size: usize) -> Vec<usize> {
    if waiting == 0 {
        return Vec::new();
    }
    calculate_idea_sizes(waiting, (waiting / cell_size.max(1)).max(1))
}

fn sorted(ids: &[IdeaId]) -> Vec<IdeaId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}

/// Rows for a set of new cells, ready to commit together with the claim
/// that justifies them.
pub(crate) struct NewCells {
    pub writes: WriteSet,
    pub cells: Vec<Cell>,
}

impl Engine {
    /// Shuffle with the engine RNG.
    pub(crate) fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng());
    }

    /// Plan seated cells for `ideas` with every member of the deliberation.
    pub(crate) fn plan_seated(&self, ideas: &[Idea], members: &[UserId], cell_size: usize) -> Vec<PlannedCell> {
        plan_seated_tier(ideas, members, cell_size, &mut *self.rng())
    }

    /// Build a cell with its opening timers.
    ///
    /// Starts DELIBERATING when a discussion window is configured, otherwise
    /// VOTING with a deadline (none under [`NO_TIMER`]).
    pub(crate) fn open_cell(
        &self,
        delib: &Deliberation,
        tier: u32,
        batch: Option<u32>,
        ideas: Vec<IdeaId>,
        now: u64,
    ) -> Result<Cell, ChantError> {
        let id = CellId(self.store().next_id()?);
        let (status, discussion_ends_at, voting_deadline) = match delib.settings.discussion_window() {
            Some(window) => (CellStatus::Deliberating, Some(now + window), None),
            None => (CellStatus::Voting, None, voting_deadline(delib, now)),
        };
        Ok(Cell {
            id,
            deliberation_id: delib.id,
            tier,
            batch,
            status,
            idea_ids: ideas,
            discussion_ends_at,
            voting_deadline,
            completed_by_timeout: false,
            created_at: now,
            completed_at: None,
        })
    }

    /// Materialize planned cells.
    ///
    /// `ideas` are the rows to move into IN_VOTING at `tier`; pass an empty
    /// slice when the caller already claimed them.
    pub(crate) fn materialize(
        &self,
        delib: &Deliberation,
        tier: u32,
        plans: Vec<PlannedCell>,
        ideas: &[Idea],
        now: u64,
    ) -> Result<NewCells, ChantError> {
        let mut writes = WriteSet::new();
        let mut cells = Vec::with_capacity(plans.len());
        let mut moved = BTreeSet::new();
        for plan in plans {
            let cell = self.open_cell(delib, tier, plan.batch, plan.ideas, now)?;
            for idea_id in &cell.idea_ids {
                if !moved.insert(*idea_id) {
                    continue;
                }
                if let Some(idea) = ideas.iter().find(|i| i.id == *idea_id) {
                    let mut idea = idea.clone();
                    idea.set_status(IdeaStatus::InVoting)?;
                    idea.tier = tier;
                    writes.push(Write::Idea(idea));
                }
            }
            for user in plan.members {
                writes.push(Write::Participation(CellParticipation {
                    cell_id: cell.id,
                    deliberation_id: delib.id,
                    user_id: user,
                    status: ParticipationStatus::Active,
                    joined_at: now,
                }));
            }
            writes.push(Write::Cell(cell.clone()));
            cells.push(cell);
        }
        Ok(NewCells { writes, cells })
    }
}

/// Voting deadline for a cell whose voting opens at `now`.
pub(crate) fn voting_deadline(delib: &Deliberation, now: u64) -> Option<u64> {
    match delib.settings.voting_timeout_ms {
        NO_TIMER => None,
        timeout => Some(now + timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chant_core::types::DeliberationId;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn idea(id: u64, author: Option<&str>) -> Idea {
        Idea {
            id: IdeaId(id),
            deliberation_id: DeliberationId(1),
            text: format!("idea {id}"),
            author: author.map(UserId::from),
            status: IdeaStatus::Submitted,
            tier: 0,
            total_xp: 0,
            losses: 0,
            is_champion: false,
            created_at: 0,
        }
    }

    fn users(n: usize) -> Vec<UserId> {
        (0..n).map(|i| UserId::new(format!("u{i}"))).collect()
    }

    #[test]
    fn eleven_ideas_twelve_members() {
        let members = users(12);
        let ideas: Vec<Idea> = (0..11)
            .map(|i| idea(i, Some(&format!("u{i}"))))
            .collect();
        let mut rng = StdRng::seed_from_u64(3);
        let plan = plan_seated_tier(&ideas, &members, 5, &mut rng);

        assert_eq!(plan.len(), 2);
        let mut sizes: Vec<usize> = plan.iter().map(|c| c.members.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![5, 7]);

        let mut seen: Vec<IdeaId> = plan.iter().flat_map(|c| c.ideas.clone()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 11);
        assert_eq!(plan.iter().map(|c| c.ideas.len()).sum::<usize>(), 11);

        // Two cells with distinct idea sets leave room to avoid every conflict.
        for cell in &plan {
            for member in &cell.members {
                let own = ideas.iter().filter(|i| i.author.as_ref() == Some(member));
                for i in own {
                    assert!(!cell.ideas.contains(&i.id), "{member} seated with own idea");
                }
            }
        }
        assert!(plan.iter().all(|c| c.batch.is_none()));
    }

    #[test]
    fn few_ideas_many_members_form_a_batch() {
        let ideas: Vec<Idea> = (0..3).map(|i| idea(i, None)).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_seated_tier(&ideas, &users(15), 5, &mut rng);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|c| c.ideas.len() == 3 && c.batch == Some(0)));
    }

    #[test]
    fn conflict_rule_yields_when_unavoidable() {
        // One cell; the author must still be seated.
        let ideas = vec![idea(1, Some("u0"))];
        let mut rng = StdRng::seed_from_u64(9);
        let plan = plan_seated_tier(&ideas, &users(3), 5, &mut rng);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].members.len(), 3);
    }

    #[test]
    fn seating_fills_small_cells_first() {
        let members = users(6);
        let seats = seat_members(&members, &[3, 3], &HashMap::new());
        assert_eq!(seats[0].len(), 3);
        assert_eq!(seats[1].len(), 3);
    }

    #[test]
    fn idea_groups_even_split() {
        let ids: Vec<IdeaId> = (0..11).map(IdeaId).collect();
        let groups = plan_idea_groups(&ids, 5, false);
        assert_eq!(groups.iter().map(Vec::len).collect::<Vec<_>>(), vec![6, 5]);
        let groups = plan_idea_groups(&ids[..3], 5, false);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn idea_groups_full_only_leaves_remainder() {
        let ids: Vec<IdeaId> = (0..12).map(IdeaId).collect();
        let groups = plan_idea_groups(&ids, 5, true);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.len() == 5));
        assert!(plan_idea_groups(&ids[..4], 5, true).is_empty());
    }

    #[test]
    fn next_group_size_never_strands_a_remainder() {
        assert_eq!(next_group_size(0, 5), 0);
        assert_eq!(next_group_size(3, 5), 3);
        assert_eq!(next_group_size(7, 5), 7);
        assert_eq!(next_group_size(11, 5), 6);
    }

    proptest! {
        #[test]
        fn seated_plan_covers_everyone(members in 3usize..60, ideas in 1u64..40, size in 3usize..=7) {
            let ideas: Vec<Idea> = (0..ideas).map(|i| idea(i, Some(&format!("u{i}")))).collect();
            let mut rng = StdRng::seed_from_u64(members as u64);
            let plan = plan_seated_tier(&ideas, &users(members), size, &mut rng);
            prop_assert_eq!(plan.iter().map(|c| c.members.len()).sum::<usize>(), members);
            prop_assert!(plan.iter().all(|c| !c.ideas.is_empty() && !c.members.is_empty()));
            let mut seen: Vec<IdeaId> = plan.iter().flat_map(|c| c.ideas.clone()).collect();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), ideas.len());
        }
    }
}
