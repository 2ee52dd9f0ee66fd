use common::status::DirStatusRow;
use common::{dir_flags, DirIdx, RuleSet, StatusArea};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Deadline passed or the watcher saw a change.
    Regular,
    /// The previous cycle stopped at a copy cap; runs after everything else.
    Continuation,
}

/// Whether a directory is due, and in which group.
pub fn due(row: &DirStatusRow, now: i64) -> Option<Priority> {
    if row.has(dir_flags::DIR_DISABLED) {
        return None;
    }
    if now >= row.next_check_time || row.has(dir_flags::INOTIFY_NEEDS_SCAN) {
        return Some(Priority::Regular);
    }
    if row.has(dir_flags::MAX_COPIED) {
        return Some(Priority::Continuation);
    }
    None
}

/// Directory entries owned by `worker` of `workers`.
pub fn owns(dir_id: u32, worker: u32, workers: u32) -> bool {
    workers <= 1 || dir_id % workers == worker
}

/// Due directories of this worker's partition, regular ones first, each
/// group in configuration order.
pub fn select(
    rules: &RuleSet,
    row_of: impl Fn(u32) -> Option<DirStatusRow>,
    now: i64,
    worker: u32,
    workers: u32,
) -> Vec<DirIdx> {
    let mut picked: Vec<(Priority, DirIdx)> = rules
        .dir_indices()
        .filter(|&d| owns(rules[d].dir_id, worker, workers))
        .filter_map(|d| {
            let row = row_of(rules[d].dir_id)?;
            due(&row, now).map(|p| (p, d))
        })
        .collect();
    picked.sort();
    picked.into_iter().map(|(_, d)| d).collect()
}

pub fn due_dirs(rules: &RuleSet, status: &StatusArea, now: i64, worker: u32, workers: u32) -> Vec<DirIdx> {
    select(
        rules,
        |dir_id| status.dir_index(dir_id).map(|idx| status.dir(idx)),
        now,
        worker,
        workers,
    )
}
