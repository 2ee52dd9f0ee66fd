//! Append-only writers for the lineage logs.
//!
//! Several processes append to the same `<BASE>.0` file. Records up to
//! `PIPE_BUF` bytes rely on O_APPEND atomicity and hold a shared fcntl lock
//! on byte 0; longer ones hold the write lock. Rotation takes the write lock
//! and writers check the inode once locked, so no record lands in a file
//! that was already renamed to `<BASE>.1`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use super::{
    DeleteRecord, DistributionRecord, EventRecord, InputRecord, LogKind, OutputRecord,
    ProductionRecord, PIPE_BUF,
};
use crate::error::{AfdError, IoContext, Result};
use crate::lock::{lock_region, LockKind};

/// Size limit and number of kept generations for one log type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPolicy {
    /// Rotate once `<BASE>.0` reaches this many bytes; 0 disables size rotation.
    pub max_size: u64,
    /// Number of files kept including `<BASE>.0`.
    pub retention: u32,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            retention: 7,
        }
    }
}

pub fn log_path(dir: &Path, kind: LogKind, number: u32) -> PathBuf {
    dir.join(format!("{}.{}", kind.base_name(), number))
}

pub struct LogWriter {
    kind: LogKind,
    dir: PathBuf,
    file: File,
    ino: u64,
    policy: LogPolicy,
}

impl LogWriter {
    pub fn open(dir: &Path, kind: LogKind, policy: LogPolicy) -> Result<Self> {
        let (file, ino) = open_current(dir, kind)?;
        Ok(Self {
            kind,
            dir: dir.to_path_buf(),
            file,
            ino,
            policy,
        })
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn path(&self) -> PathBuf {
        log_path(&self.dir, self.kind, 0)
    }

    /// Appends one complete record (including its trailing newline).
    pub fn append(&mut self, record: &str) -> Result<()> {
        let bytes = record.as_bytes();
        let kind = if bytes.len() > PIPE_BUF {
            LockKind::Write
        } else {
            LockKind::Read
        };
        loop {
            let guard = lock_region(&self.file, 0, 1, kind)
                .with_io_context(|| format!("lock {}", self.kind.base_name()))?;
            // Rotated since the last write, or while waiting for the lock.
            if current_inode(&self.dir, self.kind)? != Some(self.ino) {
                drop(guard);
                self.reopen()?;
                continue;
            }
            (&self.file)
                .write_all(bytes)
                .with_io_context(|| format!("write {}", self.kind.base_name()))?;
            break;
        }

        if self.policy.max_size > 0 {
            let size = self
                .file
                .metadata()
                .with_io_context(|| format!("stat {}", self.kind.base_name()))?
                .len();
            if size >= self.policy.max_size {
                self.rotate()?;
            }
        }
        Ok(())
    }

    /// Shifts `<BASE>.n` to `<BASE>.n+1`, dropping the oldest, and starts a
    /// fresh `<BASE>.0`. A concurrent rotation by another process is detected
    /// and not repeated.
    pub fn rotate(&mut self) -> Result<()> {
        {
            let _guard = lock_region(&self.file, 0, 1, LockKind::Write)
                .with_io_context(|| format!("lock {}", self.kind.base_name()))?;
            if current_inode(&self.dir, self.kind)? == Some(self.ino) {
                rotate_files(&self.dir, self.kind, self.policy.retention)
                    .with_io_context(|| format!("rotate {}", self.kind.base_name()))?;
                log::info!("Rotated {}", self.kind.base_name());
            }
        }
        self.reopen()
    }

    fn reopen(&mut self) -> Result<()> {
        let (file, ino) = open_current(&self.dir, self.kind)?;
        self.file = file;
        self.ino = ino;
        Ok(())
    }
}

fn open_current(dir: &Path, kind: LogKind) -> Result<(File, u64)> {
    let path = log_path(dir, kind, 0);
    let attach_err = |source: io::Error| AfdError::Attach {
        what: "log file",
        path: path.clone(),
        source,
    };
    // Readable too: a shared fcntl lock needs a descriptor open for reading.
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .mode(0o644)
        .open(&path)
        .map_err(attach_err)?;
    let ino = file.metadata().map_err(attach_err)?.ino();
    Ok((file, ino))
}

fn current_inode(dir: &Path, kind: LogKind) -> Result<Option<u64>> {
    match fs::metadata(log_path(dir, kind, 0)) {
        Ok(meta) => Ok(Some(meta.ino())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AfdError::io(format!("stat {}", kind.base_name()), e)),
    }
}

/// Renames `n -> n+1` from the oldest kept generation downwards.
pub fn rotate_files(dir: &Path, kind: LogKind, retention: u32) -> io::Result<()> {
    let keep = retention.max(1);
    match fs::remove_file(log_path(dir, kind, keep - 1)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    for n in (0..keep - 1).rev() {
        match fs::rename(log_path(dir, kind, n), log_path(dir, kind, n + 1)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

/// One writer per log stream plus the separator they share.
pub struct LogSet {
    sep: u8,
    writers: BTreeMap<LogKind, LogWriter>,
}

impl LogSet {
    pub fn open(
        dir: &Path,
        kinds: &[LogKind],
        sep: u8,
        policy: impl Fn(LogKind) -> LogPolicy,
    ) -> Result<Self> {
        let mut writers = BTreeMap::new();
        for &kind in kinds {
            writers.insert(kind, LogWriter::open(dir, kind, policy(kind))?);
        }
        Ok(Self { sep, writers })
    }

    pub fn separator(&self) -> u8 {
        self.sep
    }

    fn write(&mut self, kind: LogKind, line: String) -> Result<()> {
        match self.writers.get_mut(&kind) {
            Some(writer) => writer.append(&line),
            None => Err(AfdError::Fatal(format!(
                "{} is not open for writing",
                kind.base_name()
            ))),
        }
    }

    pub fn input(&mut self, rec: &InputRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Input, line)
    }

    pub fn distribution(&mut self, rec: &DistributionRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Distribution, line)
    }

    pub fn production(&mut self, rec: &ProductionRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Production, line)
    }

    pub fn output(&mut self, rec: &OutputRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Output, line)
    }

    pub fn delete(&mut self, rec: &DeleteRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Delete, line)
    }

    pub fn event(&mut self, rec: &EventRecord) -> Result<()> {
        let line = rec.format(self.sep);
        self.write(LogKind::Event, line)
    }

    /// On-demand rotation of every open stream.
    pub fn rotate_all(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.rotate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(n: u32) -> InputRecord {
        InputRecord {
            time: 0x10 + n as i64,
            filename: format!("f{}", n),
            size: 1,
            dir_id: 0x1f,
            unique_number: n,
        }
    }

    #[test]
    fn test_append_and_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_size: 0,
            retention: 3,
        };
        let mut writer = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        writer.append(&input(1).format(b'|')).unwrap();
        writer.rotate().unwrap();
        writer.append(&input(2).format(b'|')).unwrap();
        writer.rotate().unwrap();
        writer.append(&input(3).format(b'|')).unwrap();
        writer.rotate().unwrap();

        let read = |n| fs::read_to_string(log_path(dir.path(), LogKind::Input, n)).unwrap();
        assert_eq!(read(0), "");
        assert_eq!(read(1), "13 f3|1|1f|3\n");
        assert_eq!(read(2), "12 f2|1|1f|2\n");
        assert!(!log_path(dir.path(), LogKind::Input, 3).exists());
    }

    #[test]
    fn test_size_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_size: 20,
            retention: 5,
        };
        let mut writer = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        for n in 1..=3 {
            writer.append(&input(n).format(b'|')).unwrap();
        }
        // Every record is 13 bytes, so the log rotated after the second one.
        let current = fs::read_to_string(writer.path()).unwrap();
        assert_eq!(current, "13 f3|1|1f|3\n");
        let first = fs::read_to_string(log_path(dir.path(), LogKind::Input, 1)).unwrap();
        assert_eq!(first, "11 f1|1|1f|1\n12 f2|1|1f|2\n");
    }

    #[test]
    fn test_second_writer_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_size: 0,
            retention: 2,
        };
        let mut a = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        let mut b = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        a.append(&input(1).format(b'|')).unwrap();
        a.rotate().unwrap();
        b.append(&input(2).format(b'|')).unwrap();
        assert_eq!(fs::read_to_string(a.path()).unwrap(), "12 f2|1|1f|2\n");
    }

    #[test]
    fn test_stale_handle_writes_to_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_size: 0,
            retention: 3,
        };
        let mut writer = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        writer.append(&input(1).format(b'|')).unwrap();
        // Another process rotates behind this writer's back.
        rotate_files(dir.path(), LogKind::Input, 3).unwrap();
        writer.append(&input(2).format(b'|')).unwrap();

        let read = |n| fs::read_to_string(log_path(dir.path(), LogKind::Input, n)).unwrap();
        assert_eq!(read(1), "11 f1|1|1f|1\n");
        assert_eq!(read(0), "12 f2|1|1f|2\n");
    }

    #[test]
    fn test_long_record_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = LogSet::open(dir.path(), &[LogKind::Input], b'|', |_| LogPolicy::default())
            .unwrap();
        let mut rec = input(1);
        rec.filename = "x".repeat(PIPE_BUF + 10);
        set.input(&rec).unwrap();
        let text = fs::read_to_string(log_path(dir.path(), LogKind::Input, 0)).unwrap();
        assert_eq!(InputRecord::parse(&text, b'|').unwrap(), rec);
        assert!(set.delete(&DeleteRecord {
            time: 1,
            host_alias: None,
            reason: 0,
            filename: "a".to_string(),
            size: 0,
            job_id: 0,
            origin: None,
            user: "u".to_string(),
            additional: None,
        })
        .is_err());
    }
}
