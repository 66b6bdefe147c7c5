//! Cell sizing planners.
//!
//! Pure and deterministic: callers shuffle members and ideas before
//! applying the resulting sizes.

use crate::constants::MIN_CELL_SIZE;

/// Split `total_participants` into groups of `target_size`.
///
/// A remainder of 1 or 2 is absorbed into the last group (which grows to
/// `target_size + remainder`); a remainder of 3 or more becomes its own
/// group. With fewer than three participants the result is a single
/// undersized group, which callers must treat as degenerate.
///
/// # Examples
///
/// ```
/// use chant_core::sizing::calculate_cell_sizes;
///
/// assert_eq!(calculate_cell_sizes(12, 5), vec![5, 7]);
/// assert_eq!(calculate_cell_sizes(13, 5), vec![5, 5, 3]);
/// assert_eq!(calculate_cell_sizes(2, 5), vec![2]);
/// ```
pub fn calculate_cell_sizes(total_participants: usize, target_size: usize) -> Vec<usize> {
    if total_participants == 0 {
        return Vec::new();
    }
    let target = target_size.max(MIN_CELL_SIZE);
    if total_participants <= target {
        return vec![total_participants];
    }

    let full = total_participants / target;
    let remainder = total_participants % target;
    let mut sizes = vec![target; full];
    match remainder {
        0 => {}
        r if r >= MIN_CELL_SIZE => sizes.push(r),
        r => {
            if let Some(last) = sizes.last_mut() {
                *last += r;
            }
        }
    }
    sizes
}

/// Split `total_ideas` across `total_cells` as evenly as possible.
///
/// Earlier cells take the `+1` remainder ideas.
///
/// # Examples
///
/// ```
/// use chant_core::sizing::calculate_idea_sizes;
///
/// assert_eq!(calculate_idea_sizes(11, 2), vec![6, 5]);
/// assert_eq!(calculate_idea_sizes(10, 3), vec![4, 3, 3]);
/// ```
pub fn calculate_idea_sizes(total_ideas: usize, total_cells: usize) -> Vec<usize> {
    if total_cells == 0 {
        return Vec::new();
    }
    let base = total_ideas / total_cells;
    let extra = total_ideas % total_cells;
    (0..total_cells)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Number of distinct idea groups for a tier: one per `cell_size` ideas
/// (rounded up), never more than the number of cells available.
pub fn idea_group_count(total_ideas: usize, total_cells: usize, cell_size: usize) -> usize {
    if total_ideas == 0 || total_cells == 0 {
        return 0;
    }
    let size = cell_size.max(1);
    total_ideas.div_ceil(size).min(total_cells)
}
