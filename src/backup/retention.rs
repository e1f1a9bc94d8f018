use crate::backup::snapshot::Snapshot;
use itertools::Itertools;

/// Snapshots to delete so that at most `max_to_keep` remain, oldest first.
///
/// `None` keeps everything, and so does `Some(0)`, which config validation rejects
/// before a run gets here. Input order does not matter; snapshots are ranked by name,
/// which sorts chronologically.
pub fn get_delete(snapshots: &[Snapshot], max_to_keep: Option<usize>) -> Vec<Snapshot> {
    let Some(max_to_keep) = max_to_keep.filter(|&n| n > 0) else {
        return Vec::new();
    };
    if snapshots.len() <= max_to_keep {
        return Vec::new();
    }

    snapshots
        .iter()
        .sorted_by(|a, b| a.name().cmp(b.name()))
        .take(snapshots.len() - max_to_keep)
        .cloned()
        .collect()
}
