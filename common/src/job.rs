use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::str::FromStr;

use crate::crc32c;
use crate::error::{AfdError, IoContext, Result};
use crate::lock::{lock_region, LockKind};

/// Identity of one staged batch as seen by one recipient:
/// `(job_creation_time, unique_number, split_counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_counter: u32,
}

impl JobKey {
    pub fn new(creation_time: i64, unique_number: u32, split_counter: u32) -> Self {
        Self {
            creation_time,
            unique_number,
            split_counter,
        }
    }

    /// Pickup-time records that never reached staging carry unique number 0.
    pub fn has_unique(&self) -> bool {
        self.unique_number != 0
    }

    /// Same batch, any recipient.
    pub fn same_batch(&self, other: &JobKey) -> bool {
        self.creation_time == other.creation_time && self.unique_number == other.unique_number
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}_{:x}_{:x}",
            self.creation_time, self.unique_number, self.split_counter
        )
    }
}

impl FromStr for JobKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '_');
        let (Some(t), Some(u), Some(sp)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("'{}' is not <time>_<unique>_<split>", s));
        };
        let parse = |v: &str, what: &str| {
            u64::from_str_radix(v, 16).map_err(|_| format!("bad {} '{}' in '{}'", what, v, s))
        };
        Ok(JobKey {
            creation_time: parse(t, "time")? as i64,
            unique_number: parse(u, "unique number")? as u32,
            split_counter: parse(sp, "split counter")? as u32,
        })
    }
}

/// Name of the staging directory for a batch: `<hex-time>_<hex-unique>`.
pub fn batch_dir_name(creation_time: i64, unique_number: u32) -> String {
    format!("{:x}_{:x}", creation_time, unique_number)
}

/// Directory ids are the CRC32C of the absolute path.
pub fn directory_id(path: &str) -> u32 {
    crc32c::crc32c(path.as_bytes())
}

/// Job ids are the CRC32C of a canonical description of the route so the
/// same logical route keeps its id across restarts.
pub fn job_id(dir_id: u32, dest_group: &str, options: &[String], recipient: &str) -> u32 {
    let mut canonical = format!("{:x}\n{}\n{}\n", dir_id, dest_group, recipient);
    for option in options {
        canonical.push_str(option);
        canonical.push('\n');
    }
    crc32c::crc32c(canonical.as_bytes())
}

const COUNTER_SIZE: u64 = 12;

/// Cross-process `unique_number` source. Stored as `{second: i64, counter: u32}`
/// and guarded by an fcntl lock; the counter restarts at 1 every new second.
pub struct UniqueCounter {
    file: File,
}

impl UniqueCounter {
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .map_err(|source| AfdError::Attach {
                what: "unique counter",
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { file })
    }

    pub fn detach(self) {}

    /// Next number for the wall-clock second `now`. A clock that went
    /// backwards keeps counting within the stored second's sequence.
    pub fn next(&mut self, now: i64) -> Result<(i64, u32)> {
        let _guard = lock_region(&self.file, 0, COUNTER_SIZE, LockKind::Write)
            .io_context("lock unique counter")?;
        let mut buf = [0u8; COUNTER_SIZE as usize];
        let n = self.file.read_at(&mut buf, 0).io_context("read unique counter")?;
        let (second, counter) = if n == COUNTER_SIZE as usize {
            let mut s = [0u8; 8];
            s.copy_from_slice(&buf[..8]);
            let mut c = [0u8; 4];
            c.copy_from_slice(&buf[8..]);
            (i64::from_ne_bytes(s), u32::from_ne_bytes(c))
        } else {
            (0, 0)
        };

        let (second, counter) = if now > second {
            (now, 1)
        } else {
            (second, counter.wrapping_add(1).max(1))
        };

        buf[..8].copy_from_slice(&second.to_ne_bytes());
        buf[8..].copy_from_slice(&counter.to_ne_bytes());
        self.file.write_at(&buf, 0).io_context("write unique counter")?;
        Ok((second, counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_job_key_round_trip_text() {
        let key = JobKey::new(0x5f00_0000, 0x1a, 2);
        assert_eq!(key.to_string(), "5f000000_1a_2");
        assert_eq!("5f000000_1a_2".parse::<JobKey>().unwrap(), key);
        assert!("5f000000_1a".parse::<JobKey>().is_err());
        assert!("zz_1_0".parse::<JobKey>().is_err());
    }

    #[test]
    fn test_counter_resets_each_second() {
        let dir = tempfile::tempdir().unwrap();
        let mut counter = UniqueCounter::attach(&dir.path().join("counter")).unwrap();
        assert_eq!(counter.next(100).unwrap(), (100, 1));
        assert_eq!(counter.next(100).unwrap(), (100, 2));
        assert_eq!(counter.next(101).unwrap(), (101, 1));
        // Clock stepped back: stay unique inside the newer second.
        assert_eq!(counter.next(99).unwrap(), (101, 2));
    }

    #[test]
    fn test_counter_pairs_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter");
        let mut a = UniqueCounter::attach(&path).unwrap();
        let mut b = UniqueCounter::attach(&path).unwrap();
        let mut seen = HashSet::new();
        for i in 0..50 {
            let now = 1000 + i / 10;
            assert!(seen.insert(a.next(now).unwrap()));
            assert!(seen.insert(b.next(now).unwrap()));
        }
    }

    #[test]
    fn test_ids_are_stable() {
        assert_eq!(directory_id("/data/in"), directory_id("/data/in"));
        assert_ne!(directory_id("/data/in"), directory_id("/data/in2"));
        let a = job_id(1, "dg1", &["rename * *.x".to_string()], "ftp://u@h/p");
        let b = job_id(1, "dg1", &["rename * *.x".to_string()], "ftp://u@h/p");
        let c = job_id(1, "dg1", &[], "ftp://u@h/p");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
