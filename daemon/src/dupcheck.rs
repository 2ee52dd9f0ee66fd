//! Per-directory duplicate fingerprints with a time to live.
//!
//! `files/crc/<hex-dir-id>` is a mapped table of `{crc: u32, mode: u32,
//! expires: i64}` rows. Expired rows are dropped lazily while searching.

use std::path::Path;

use common::crc32c;
use common::mmap::{get_i64, get_u32, put_i64, put_u32, MappedTable};
use common::rules::DupMode;
use common::Result;

const MAGIC: u32 = 0x4146_4443;
const VERSION: u8 = 1;
const ROW: usize = 16;
const R_CRC: usize = 0;
const R_MODE: usize = 4;
const R_EXPIRES: usize = 8;

fn mode_code(mode: DupMode) -> u32 {
    match mode {
        DupMode::Content => 1,
        DupMode::Name => 2,
        DupMode::NameSize => 3,
    }
}

/// Fingerprint of one candidate file.
pub fn fingerprint(path: &Path, name: &str, size: u64, mode: DupMode) -> std::io::Result<u32> {
    match mode {
        DupMode::Content => crc32c::file_crc32c(path),
        DupMode::Name => Ok(crc32c::crc32c(name.as_bytes())),
        DupMode::NameSize => Ok(crc32c::append(crc32c::crc32c(name.as_bytes()), &size.to_ne_bytes())),
    }
}

pub struct DupStore {
    table: MappedTable,
}

impl DupStore {
    pub fn attach(path: &Path) -> Result<Self> {
        Ok(Self {
            table: MappedTable::open(path, "duplicate check store", MAGIC, VERSION, ROW)?,
        })
    }

    pub fn detach(self) {}

    fn remove_row(&mut self, idx: usize) {
        let last = self.table.count() - 1;
        if idx != last {
            let moved = self.table.row(last).to_vec();
            self.table.row_mut(idx).copy_from_slice(&moved);
        }
        self.table.set_count(last);
    }

    /// True when `crc` was seen within its TTL. A first sighting is
    /// recorded with expiry `now + ttl` and reported as new.
    pub fn is_duplicate(&mut self, crc: u32, mode: DupMode, now: i64, ttl: u64) -> Result<bool> {
        let _guard = self.table.lock_header()?;
        self.table.refresh()?;
        let code = mode_code(mode);
        let mut idx = 0;
        while idx < self.table.count() {
            let row = self.table.row(idx);
            if get_i64(row, R_EXPIRES) <= now {
                self.remove_row(idx);
                continue;
            }
            if get_u32(row, R_CRC) == crc && get_u32(row, R_MODE) == code {
                return Ok(true);
            }
            idx += 1;
        }

        let count = self.table.count();
        self.table.ensure_capacity(count + 1)?;
        let row = self.table.row_mut(count);
        put_u32(row, R_CRC, crc);
        put_u32(row, R_MODE, code);
        put_i64(row, R_EXPIRES, now + ttl as i64);
        self.table.set_count(count + 1);
        Ok(false)
    }

    /// Takes back a fingerprint recorded for a file whose pickup then failed.
    pub fn withdraw(&mut self, crc: u32, mode: DupMode) -> Result<()> {
        let _guard = self.table.lock_header()?;
        self.table.refresh()?;
        let code = mode_code(mode);
        if let Some(idx) = (0..self.table.count())
            .find(|&i| get_u32(self.table.row(i), R_CRC) == crc && get_u32(self.table.row(i), R_MODE) == code)
        {
            self.remove_row(idx);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::attach(&dir.path().join("1f")).unwrap();
        assert!(!store.is_duplicate(0xabc, DupMode::Content, 100, 60).unwrap());
        assert!(store.is_duplicate(0xabc, DupMode::Content, 101, 60).unwrap());
        assert!(store.is_duplicate(0xabc, DupMode::Content, 159, 60).unwrap());
        // Expired: seen as new again and re-armed.
        assert!(!store.is_duplicate(0xabc, DupMode::Content, 160, 60).unwrap());
        assert!(store.is_duplicate(0xabc, DupMode::Content, 161, 60).unwrap());
        assert!(!store.is_duplicate(0xabc, DupMode::Name, 161, 60).unwrap());
    }

    #[test]
    fn test_withdraw_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1f");
        let mut store = DupStore::attach(&path).unwrap();
        for crc in 0..40 {
            assert!(!store.is_duplicate(crc, DupMode::Name, 10, 100).unwrap());
        }
        store.withdraw(7, DupMode::Name).unwrap();
        assert_eq!(store.len(), 39);
        store.detach();

        let mut store = DupStore::attach(&path).unwrap();
        assert!(!store.is_duplicate(7, DupMode::Name, 11, 100).unwrap());
        assert!(store.is_duplicate(8, DupMode::Name, 11, 100).unwrap());
    }

    #[test]
    fn test_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"payload").unwrap();
        std::fs::write(&b, b"payload").unwrap();
        assert_eq!(
            fingerprint(&a, "a.bin", 7, DupMode::Content).unwrap(),
            fingerprint(&b, "b.bin", 7, DupMode::Content).unwrap()
        );
        assert_ne!(
            fingerprint(&a, "a.bin", 7, DupMode::Name).unwrap(),
            fingerprint(&b, "b.bin", 7, DupMode::Name).unwrap()
        );
        assert_ne!(
            fingerprint(&a, "a.bin", 7, DupMode::NameSize).unwrap(),
            fingerprint(&a, "a.bin", 8, DupMode::NameSize).unwrap()
        );
    }
}
