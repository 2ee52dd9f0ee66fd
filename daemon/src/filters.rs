//! Per-file checks applied while listing and scanning a directory.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use common::mask::{self, MaskMatch};
use common::rules::{FileGroupIdx, RuleSet, ScanPolicy};
use common::DirIdx;
use nix::unistd::{getegid, geteuid, getgroups, Gid};

/// One regular file found in a scanned directory.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev: u64,
}

impl Candidate {
    fn from_meta(name: String, path: PathBuf, meta: &Metadata) -> Self {
        Self {
            name,
            path,
            size: meta.len(),
            mtime: meta.mtime(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            dev: meta.dev(),
        }
    }

    pub fn age(&self, now: i64) -> u64 {
        (now - self.mtime).max(0) as u64
    }
}

/// Lists the regular files of `dir` in name order, skipping dot files and
/// names matching a lock-file mask. Files that vanish between readdir and
/// stat are skipped silently.
pub fn list_candidates(dir: &Path, policy: &ScanPolicy) -> io::Result<Vec<Candidate>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            log::warn!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        if name.starts_with('.') || mask::any_matches(&policy.lock_files, &name) {
            continue;
        }
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.file_type().is_file() {
            continue;
        }
        found.push(Candidate::from_meta(name, path, &meta));
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// True when ignore-size or ignore-file-time rules out the file. The age
/// rule does not apply to directories filled by remote retrieval.
pub fn ignored(policy: &ScanPolicy, file: &Candidate, now: i64, remote: bool) -> bool {
    if let Some(rule) = policy.ignore_size {
        if rule.ignores(file.size) {
            return true;
        }
    }
    if !remote {
        if let Some(rule) = policy.ignore_file_time {
            if rule.ignores(file.age(now)) {
                return true;
            }
        }
    }
    false
}

/// Effective identity used for read permission checks.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn current() -> Self {
        let groups = getgroups()
            .map(|g| g.into_iter().map(Gid::as_raw).collect())
            .unwrap_or_default();
        Self {
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            groups,
        }
    }

    /// Mode bit inspection against owner, group and supplementary groups.
    pub fn can_read(&self, file: &Candidate) -> bool {
        if self.uid == 0 {
            return true;
        }
        if file.uid == self.uid {
            return file.mode & 0o400 != 0;
        }
        if file.gid == self.gid || self.groups.contains(&file.gid) {
            return file.mode & 0o040 != 0;
        }
        file.mode & 0o004 != 0
    }
}

/// Every file group of `dir` that accepts `name`, in configuration order.
pub fn matching_groups(rules: &RuleSet, dir: DirIdx, name: &str) -> Vec<FileGroupIdx> {
    rules[dir]
        .file_groups
        .iter()
        .copied()
        .filter(|&fg| {
            let group = &rules[fg];
            group.accepts_all() || mask::evaluate_group(&group.masks, name) == MaskMatch::Accept
        })
        .collect()
}

/// Compares the last byte of the file with `expected`. Empty files never match.
pub fn ends_with(path: &Path, expected: u8) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == expected)
}
