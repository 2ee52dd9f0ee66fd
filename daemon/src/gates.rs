//! Optional checks that may veto a pickup cycle before anything moves.

use common::rules::{RuleSet, ScanPolicy};
use common::DirIdx;

use crate::filters::{self, Candidate, Credentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    /// No file matches the wait-for pattern yet.
    WaitingForFile,
    /// Fewer files and bytes than the accumulate thresholds.
    Accumulating { files: u32, bytes: u64 },
}

fn usable(policy: &ScanPolicy, file: &Candidate, creds: &Credentials, now: i64, remote: bool) -> bool {
    !filters::ignored(policy, file, now, remote) && creds.can_read(file)
}

/// Evaluates wait-for-file, then accumulate.
pub fn evaluate(
    rules: &RuleSet,
    dir: DirIdx,
    listing: &[Candidate],
    creds: &Credentials,
    now: i64,
) -> Gate {
    let entry = &rules[dir];
    let policy = &entry.policy;
    let remote = entry.is_remote();

    if let Some(pattern) = &policy.wait_for_filename {
        let present = listing
            .iter()
            .any(|f| pattern.matches(&f.name) && usable(policy, f, creds, now, remote));
        if !present {
            return Gate::WaitingForFile;
        }
    }

    if policy.accumulate.is_none() && policy.accumulate_size.is_none() {
        return Gate::Open;
    }
    let mut files = 0u32;
    let mut bytes = 0u64;
    for f in listing {
        if !usable(policy, f, creds, now, remote) || filters::matching_groups(rules, dir, &f.name).is_empty() {
            continue;
        }
        files += 1;
        bytes += f.size;
        let enough_files = policy.accumulate.map_or(false, |n| files >= n);
        let enough_bytes = policy.accumulate_size.map_or(false, |s| bytes >= s);
        if enough_files || enough_bytes {
            return Gate::Open;
        }
    }
    Gate::Accumulating { files, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::rules::{DirEntry, DirSource, FileGroup};
    use common::FileGroupIdx;
    use std::path::PathBuf;

    fn rules(policy: ScanPolicy) -> RuleSet {
        RuleSet {
            dirs: vec![DirEntry {
                dir_id: 1,
                alias: "A".to_string(),
                path: PathBuf::from("/in"),
                source: DirSource::Local,
                host: None,
                file_groups: vec![FileGroupIdx(0)],
                policy,
                inotify: false,
                fs_root: PathBuf::from("/work/files"),
                config_file: "DIR_CONFIG".to_string(),
            }],
            file_groups: vec![FileGroup {
                name: "csv".to_string(),
                dir: DirIdx(0),
                masks: vec!["*.csv".parse().unwrap()],
                dest_groups: vec![],
            }],
            ..RuleSet::default()
        }
    }

    fn file(name: &str, size: u64) -> Candidate {
        Candidate {
            name: name.to_string(),
            path: PathBuf::from(name),
            size,
            mtime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            dev: 0,
        }
    }

    fn creds() -> Credentials {
        Credentials { uid: 0, gid: 0, groups: vec![] }
    }

    #[test]
    fn test_wait_for_file() {
        let rules = rules(ScanPolicy {
            wait_for_filename: Some("READY".parse().unwrap()),
            ..ScanPolicy::default()
        });
        let listing = vec![file("a.csv", 1)];
        assert_eq!(evaluate(&rules, DirIdx(0), &listing, &creds(), 100), Gate::WaitingForFile);
        let listing = vec![file("a.csv", 1), file("READY", 0)];
        assert_eq!(evaluate(&rules, DirIdx(0), &listing, &creds(), 100), Gate::Open);
    }

    #[test]
    fn test_accumulate_counts_only_matching_files() {
        let rules = rules(ScanPolicy {
            accumulate: Some(2),
            accumulate_size: Some(1000),
            ..ScanPolicy::default()
        });
        let listing = vec![file("a.csv", 10), file("b.txt", 5000)];
        assert_eq!(
            evaluate(&rules, DirIdx(0), &listing, &creds(), 100),
            Gate::Accumulating { files: 1, bytes: 10 }
        );
        let listing = vec![file("a.csv", 10), file("b.csv", 10)];
        assert_eq!(evaluate(&rules, DirIdx(0), &listing, &creds(), 100), Gate::Open);
        let listing = vec![file("big.csv", 1000)];
        assert_eq!(evaluate(&rules, DirIdx(0), &listing, &creds(), 100), Gate::Open);
    }
}
