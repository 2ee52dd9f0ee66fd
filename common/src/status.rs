//! Shared status tables: one row per directory entry and one per host.
//!
//! Readers look at rows without locking and accept momentarily stale
//! values. Writers lock exactly the bytes they change.

use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::mmap::{get_i64, get_str, get_u32, get_u64, put_i64, put_str, put_u32, put_u64, MappedTable};

const VERSION: u8 = 1;
const DIR_MAGIC: u32 = 0x4146_4453;
const HOST_MAGIC: u32 = 0x4146_4853;
const ALIAS_LEN: usize = 24;

pub mod dir_flags {
    pub const ERROR_SET: u32 = 0x01;
    pub const MAX_COPIED: u32 = 0x02;
    pub const INOTIFY_NEEDS_SCAN: u32 = 0x04;
    pub const ALL_DISABLED: u32 = 0x08;
    pub const INFO_TIME_REACHED: u32 = 0x10;
    pub const WARN_TIME_REACHED: u32 = 0x20;
    /// Queue stopped: accepted files go to the paused directory.
    pub const DIR_STOPPED: u32 = 0x40;
    pub const DIR_DISABLED: u32 = 0x80;
}

pub mod host_flags {
    pub const HOST_DISABLED: u32 = 0x01;
    pub const PAUSE_QUEUE: u32 = 0x02;
    pub const STOP_TRANSFER: u32 = 0x04;
    pub const HOST_ERROR: u32 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirStatus {
    Normal = 0,
    Warning = 1,
    Error = 2,
    Stopped = 3,
    Disabled = 4,
}

impl DirStatus {
    fn from_code(code: u32) -> Self {
        match code {
            1 => DirStatus::Warning,
            2 => DirStatus::Error,
            3 => DirStatus::Stopped,
            4 => DirStatus::Disabled,
            _ => DirStatus::Normal,
        }
    }
}

// DirStatus row layout.
const D_ID: usize = 0;
const D_FLAGS: usize = 4;
const D_STATUS: usize = 8;
const D_ERRORS: usize = 12;
const D_FILES_IN_DIR: usize = 16;
const D_BYTES_IN_DIR: usize = 24;
const D_FILES_RECEIVED: usize = 32;
const D_BYTES_RECEIVED: usize = 40;
const D_LAST_RETRIEVAL: usize = 48;
const D_NEXT_CHECK: usize = 56;
const D_QUEUED: usize = 64;
const D_ALIAS: usize = 72;
const DIR_ROW: usize = D_ALIAS + ALIAS_LEN;

// HostStatus row layout.
const H_ID: usize = 0;
const H_FLAGS: usize = 4;
const H_ERRORS: usize = 8;
const H_JOBS_QUEUED: usize = 12;
const H_ACTIVE: usize = 16;
const H_TOGGLE: usize = 20;
const H_FILES_SENT: usize = 24;
const H_BYTES_SENT: usize = 32;
const H_LAST_CONNECTION: usize = 40;
const H_ALIAS: usize = 48;
const HOST_ROW: usize = H_ALIAS + ALIAS_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirStatusRow {
    pub dir_id: u32,
    pub alias: String,
    pub dir_flags: u32,
    pub status: DirStatus,
    pub error_counter: u32,
    pub files_in_dir: u32,
    pub bytes_in_dir: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    pub last_retrieval: i64,
    pub next_check_time: i64,
    pub queued: u32,
}

impl DirStatusRow {
    pub fn has(&self, flag: u32) -> bool {
        self.dir_flags & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatusRow {
    pub host_id: u32,
    pub alias: String,
    pub host_flags: u32,
    pub error_counter: u32,
    pub jobs_queued: u32,
    pub active_transfers: u32,
    pub toggle: u32,
    pub files_sent: u64,
    pub bytes_sent: u64,
    pub last_connection: i64,
}

impl HostStatusRow {
    pub fn is_disabled(&self) -> bool {
        self.host_flags & host_flags::HOST_DISABLED != 0
    }
}

/// Counters committed at the end of one pickup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCommit {
    pub files_in_dir: u32,
    pub bytes_in_dir: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    /// Only written when files were picked up.
    pub last_retrieval: Option<i64>,
}

pub struct StatusArea {
    dirs: MappedTable,
    hosts: MappedTable,
}

impl StatusArea {
    pub fn attach(dir_status: &Path, host_status: &Path) -> Result<Self> {
        Ok(Self {
            dirs: MappedTable::open(dir_status, "directory status table", DIR_MAGIC, VERSION, DIR_ROW)?,
            hosts: MappedTable::open(host_status, "host status table", HOST_MAGIC, VERSION, HOST_ROW)?,
        })
    }

    pub fn detach(self) {}

    /// Remaps after the supervisor rebuilt the tables.
    pub fn refresh(&mut self) -> Result<()> {
        self.dirs.refresh()?;
        self.hosts.refresh()
    }

    /// Lays the tables out for a new configuration generation. Rows of ids
    /// that survive keep their counters; new ids start at zero.
    pub fn rebuild(&mut self, dirs: &[(u32, &str)], hosts: &[(u32, &str)]) -> Result<()> {
        {
            let _guard = self.dirs.lock_header()?;
            self.dirs.refresh()?;
            let old: Vec<Vec<u8>> = (0..self.dirs.count()).map(|i| self.dirs.row(i).to_vec()).collect();
            self.dirs.ensure_capacity(dirs.len())?;
            for (idx, (id, alias)) in dirs.iter().enumerate() {
                let previous = old.iter().find(|r| get_u32(r, D_ID) == *id);
                let row = self.dirs.row_mut(idx);
                match previous {
                    Some(prev) => row.copy_from_slice(prev),
                    None => {
                        row.fill(0);
                        put_u32(row, D_ID, *id);
                    }
                }
                put_str(row, D_ALIAS, ALIAS_LEN, alias);
            }
            self.dirs.set_count(dirs.len());
            self.dirs.flush()?;
        }

        let _guard = self.hosts.lock_header()?;
        self.hosts.refresh()?;
        let old: Vec<Vec<u8>> = (0..self.hosts.count()).map(|i| self.hosts.row(i).to_vec()).collect();
        self.hosts.ensure_capacity(hosts.len())?;
        for (idx, (id, alias)) in hosts.iter().enumerate() {
            let previous = old.iter().find(|r| get_u32(r, H_ID) == *id);
            let row = self.hosts.row_mut(idx);
            match previous {
                Some(prev) => row.copy_from_slice(prev),
                None => {
                    row.fill(0);
                    put_u32(row, H_ID, *id);
                }
            }
            put_str(row, H_ALIAS, ALIAS_LEN, alias);
        }
        self.hosts.set_count(hosts.len());
        self.hosts.flush()
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.count()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.count()
    }

    pub fn dir_index(&self, dir_id: u32) -> Option<usize> {
        (0..self.dirs.count()).find(|&i| get_u32(self.dirs.row(i), D_ID) == dir_id)
    }

    pub fn host_index(&self, alias: &str) -> Option<usize> {
        (0..self.hosts.count()).find(|&i| get_str(self.hosts.row(i), H_ALIAS, ALIAS_LEN) == alias)
    }

    pub fn dir(&self, idx: usize) -> DirStatusRow {
        let r = self.dirs.row(idx);
        DirStatusRow {
            dir_id: get_u32(r, D_ID),
            alias: get_str(r, D_ALIAS, ALIAS_LEN),
            dir_flags: get_u32(r, D_FLAGS),
            status: DirStatus::from_code(get_u32(r, D_STATUS)),
            error_counter: get_u32(r, D_ERRORS),
            files_in_dir: get_u32(r, D_FILES_IN_DIR),
            bytes_in_dir: get_u64(r, D_BYTES_IN_DIR),
            files_received: get_u64(r, D_FILES_RECEIVED),
            bytes_received: get_u64(r, D_BYTES_RECEIVED),
            last_retrieval: get_i64(r, D_LAST_RETRIEVAL),
            next_check_time: get_i64(r, D_NEXT_CHECK),
            queued: get_u32(r, D_QUEUED),
        }
    }

    pub fn host(&self, idx: usize) -> HostStatusRow {
        let r = self.hosts.row(idx);
        HostStatusRow {
            host_id: get_u32(r, H_ID),
            alias: get_str(r, H_ALIAS, ALIAS_LEN),
            host_flags: get_u32(r, H_FLAGS),
            error_counter: get_u32(r, H_ERRORS),
            jobs_queued: get_u32(r, H_JOBS_QUEUED),
            active_transfers: get_u32(r, H_ACTIVE),
            toggle: get_u32(r, H_TOGGLE),
            files_sent: get_u64(r, H_FILES_SENT),
            bytes_sent: get_u64(r, H_BYTES_SENT),
            last_connection: get_i64(r, H_LAST_CONNECTION),
        }
    }

    fn update_dir_u32(&mut self, idx: usize, off: usize, f: impl FnOnce(u32) -> u32) -> Result<(u32, u32)> {
        let _guard = self.dirs.lock_field(idx, off, 4)?;
        let row = self.dirs.row_mut(idx);
        let old = get_u32(row, off);
        let new = f(old);
        put_u32(row, off, new);
        Ok((old, new))
    }

    /// Sets `flags`; returns the flags as they were before.
    pub fn set_dir_flags(&mut self, idx: usize, flags: u32) -> Result<u32> {
        self.update_dir_u32(idx, D_FLAGS, |f| f | flags).map(|(old, _)| old)
    }

    /// Clears `flags`; returns the flags as they were before.
    pub fn clear_dir_flags(&mut self, idx: usize, flags: u32) -> Result<u32> {
        self.update_dir_u32(idx, D_FLAGS, |f| f & !flags).map(|(old, _)| old)
    }

    pub fn set_dir_status(&mut self, idx: usize, status: DirStatus) -> Result<()> {
        self.update_dir_u32(idx, D_STATUS, |_| status as u32).map(|_| ())
    }

    /// Returns the new error counter.
    pub fn increment_errors(&mut self, idx: usize) -> Result<u32> {
        self.update_dir_u32(idx, D_ERRORS, |c| c.saturating_add(1)).map(|(_, new)| new)
    }

    /// Returns the counter before it was cleared.
    pub fn reset_errors(&mut self, idx: usize) -> Result<u32> {
        self.update_dir_u32(idx, D_ERRORS, |_| 0).map(|(old, _)| old)
    }

    pub fn set_queued(&mut self, idx: usize, queued: u32) -> Result<()> {
        self.update_dir_u32(idx, D_QUEUED, |_| queued).map(|_| ())
    }

    pub fn set_next_check(&mut self, idx: usize, when: i64) -> Result<()> {
        let _guard = self.dirs.lock_field(idx, D_NEXT_CHECK, 8)?;
        put_i64(self.dirs.row_mut(idx), D_NEXT_CHECK, when);
        Ok(())
    }

    /// Writes the end-of-cycle counters under one lock spanning them.
    pub fn commit_scan(&mut self, idx: usize, commit: &ScanCommit) -> Result<()> {
        let _guard = self
            .dirs
            .lock_field(idx, D_FILES_IN_DIR, D_NEXT_CHECK - D_FILES_IN_DIR)?;
        let row = self.dirs.row_mut(idx);
        put_u32(row, D_FILES_IN_DIR, commit.files_in_dir);
        put_u64(row, D_BYTES_IN_DIR, commit.bytes_in_dir);
        let files = get_u64(row, D_FILES_RECEIVED).wrapping_add(commit.files_received);
        put_u64(row, D_FILES_RECEIVED, files);
        let bytes = get_u64(row, D_BYTES_RECEIVED).wrapping_add(commit.bytes_received);
        put_u64(row, D_BYTES_RECEIVED, bytes);
        if let Some(t) = commit.last_retrieval {
            put_i64(row, D_LAST_RETRIEVAL, t);
        }
        Ok(())
    }

    fn update_host_u32(&mut self, idx: usize, off: usize, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        let _guard = self.hosts.lock_field(idx, off, 4)?;
        let row = self.hosts.row_mut(idx);
        let old = get_u32(row, off);
        put_u32(row, off, f(old));
        Ok(old)
    }

    pub fn set_host_disabled(&mut self, idx: usize, disabled: bool) -> Result<()> {
        self.update_host_u32(idx, H_FLAGS, |f| {
            if disabled {
                f | host_flags::HOST_DISABLED
            } else {
                f & !host_flags::HOST_DISABLED
            }
        })
        .map(|_| ())
    }

    pub fn set_host_flags(&mut self, idx: usize, flags: u32) -> Result<u32> {
        self.update_host_u32(idx, H_FLAGS, |f| f | flags)
    }

    pub fn clear_host_flags(&mut self, idx: usize, flags: u32) -> Result<u32> {
        self.update_host_u32(idx, H_FLAGS, |f| f & !flags)
    }

    pub fn set_host_toggle(&mut self, idx: usize, toggle: u32) -> Result<()> {
        self.update_host_u32(idx, H_TOGGLE, |_| toggle).map(|_| ())
    }

    pub fn add_jobs_queued(&mut self, idx: usize, jobs: u32) -> Result<()> {
        self.update_host_u32(idx, H_JOBS_QUEUED, |q| q.saturating_add(jobs))
            .map(|_| ())
    }

    pub fn flush(&self) -> Result<()> {
        self.dirs.flush()?;
        self.hosts.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(dir: &Path) -> StatusArea {
        StatusArea::attach(&dir.join("dir_status"), &dir.join("host_status")).unwrap()
    }

    #[test]
    fn test_rebuild_keeps_surviving_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = area(dir.path());
        status.rebuild(&[(0x1f, "A"), (0x20, "B")], &[(7, "hostA")]).unwrap();
        let idx = status.dir_index(0x20).unwrap();
        status.increment_errors(idx).unwrap();
        status.increment_errors(idx).unwrap();

        status.rebuild(&[(0x20, "B"), (0x30, "C")], &[(7, "hostA")]).unwrap();
        assert_eq!(status.dir_count(), 2);
        assert_eq!(status.dir_index(0x1f), None);
        let row = status.dir(status.dir_index(0x20).unwrap());
        assert_eq!(row.error_counter, 2);
        assert_eq!(row.alias, "B");
        assert_eq!(status.dir(1).error_counter, 0);
    }

    #[test]
    fn test_flags_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = area(dir.path());
        status.rebuild(&[(0x1f, "A")], &[]).unwrap();
        assert_eq!(status.set_dir_flags(0, dir_flags::MAX_COPIED).unwrap(), 0);
        status.set_dir_flags(0, dir_flags::ERROR_SET).unwrap();
        let before = status.clear_dir_flags(0, dir_flags::MAX_COPIED).unwrap();
        assert_eq!(before, dir_flags::MAX_COPIED | dir_flags::ERROR_SET);
        assert!(!status.dir(0).has(dir_flags::MAX_COPIED));

        let commit = ScanCommit {
            files_in_dir: 4,
            bytes_in_dir: 40,
            files_received: 3,
            bytes_received: 30,
            last_retrieval: Some(1000),
        };
        status.commit_scan(0, &commit).unwrap();
        status.commit_scan(0, &ScanCommit { last_retrieval: None, ..commit }).unwrap();
        let row = status.dir(0);
        assert_eq!(row.files_received, 6);
        assert_eq!(row.bytes_in_dir, 40);
        assert_eq!(row.last_retrieval, 1000);
    }

    #[test]
    fn test_second_attach_sees_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = area(dir.path());
        writer.rebuild(&[], &[(1, "hostA"), (2, "hostB")]).unwrap();
        writer.set_host_disabled(1, true).unwrap();
        let reader = area(dir.path());
        let idx = reader.host_index("hostB").unwrap();
        assert!(reader.host(idx).is_disabled());
        assert!(!reader.host(0).is_disabled());
    }
}
