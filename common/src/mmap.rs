//! Fixed-row, memory-mapped tables shared between processes.
//!
//! Layout: a 16 byte header `{magic: u32, version: u8, pad: [u8; 3],
//! count: u32, reserved: u32}` followed by `capacity` rows of `row_size`
//! bytes. All integers are host byte order.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{AfdError, Result};
use crate::lock::{lock_region, LockKind, RegionGuard};

pub const HEADER_SIZE: usize = 16;
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_COUNT: usize = 8;

/// Rows are added in steps of this many to avoid remapping on every append.
const GROW_STEP: usize = 32;

pub struct MappedTable {
    path: PathBuf,
    file: File,
    map: MmapMut,
    row_size: usize,
}

impl MappedTable {
    /// Opens (creating if needed) a table. An existing file with a different
    /// magic or version is rejected rather than reinterpreted.
    pub fn open(path: &Path, what: &'static str, magic: u32, version: u8, row_size: usize) -> Result<Self> {
        let attach_err = |source: io::Error| AfdError::Attach {
            what,
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .map_err(attach_err)?;

        {
            let _guard = lock_region(&file, 0, HEADER_SIZE as u64, LockKind::Write).map_err(attach_err)?;
            let len = file.metadata().map_err(attach_err)?.len() as usize;
            if len < HEADER_SIZE {
                file.set_len((HEADER_SIZE + GROW_STEP * row_size) as u64)
                    .map_err(attach_err)?;
                // SAFETY: the file is at least HEADER_SIZE bytes and exclusively locked.
                let mut map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(attach_err)?;
                put_u32(&mut map, OFF_MAGIC, magic);
                map[OFF_VERSION] = version;
                put_u32(&mut map, OFF_COUNT, 0);
                map.flush().map_err(attach_err)?;
            }
        }

        // SAFETY: concurrent writers coordinate through fcntl region locks.
        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(attach_err)?;
        if get_u32(&map, OFF_MAGIC) != magic || map[OFF_VERSION] != version {
            return Err(AfdError::Attach {
                what,
                path: path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "magic/version mismatch ({:#x}/{} expected {:#x}/{})",
                        get_u32(&map, OFF_MAGIC),
                        map[OFF_VERSION],
                        magic,
                        version
                    ),
                ),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            row_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn count(&self) -> usize {
        get_u32(&self.map, OFF_COUNT) as usize
    }

    pub fn set_count(&mut self, count: usize) {
        put_u32(&mut self.map, OFF_COUNT, count as u32);
    }

    pub fn capacity(&self) -> usize {
        (self.map.len() - HEADER_SIZE) / self.row_size
    }

    /// Remaps when another process has grown the file.
    pub fn refresh(&mut self) -> Result<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| AfdError::io(format!("stat {}", self.path.display()), e))?
            .len() as usize;
        if len != self.map.len() {
            self.remap()?;
        }
        Ok(())
    }

    /// Guarantees room for `rows` rows, growing the file if needed.
    pub fn ensure_capacity(&mut self, rows: usize) -> Result<()> {
        self.refresh()?;
        if rows <= self.capacity() {
            return Ok(());
        }
        let new_rows = (rows / GROW_STEP + 1) * GROW_STEP;
        self.map
            .flush()
            .map_err(|e| AfdError::io(format!("flush {}", self.path.display()), e))?;
        self.file
            .set_len((HEADER_SIZE + new_rows * self.row_size) as u64)
            .map_err(|e| AfdError::io(format!("grow {}", self.path.display()), e))?;
        self.remap()
    }

    fn remap(&mut self) -> Result<()> {
        // SAFETY: see `open`.
        self.map = unsafe { MmapOptions::new().map_mut(&self.file) }
            .map_err(|e| AfdError::io(format!("mmap {}", self.path.display()), e))?;
        Ok(())
    }

    pub fn row_offset(&self, idx: usize) -> usize {
        HEADER_SIZE + idx * self.row_size
    }

    pub fn row(&self, idx: usize) -> &[u8] {
        let off = self.row_offset(idx);
        &self.map[off..off + self.row_size]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [u8] {
        let off = self.row_offset(idx);
        let size = self.row_size;
        &mut self.map[off..off + size]
    }

    /// Locks `len` bytes at `field_off` inside row `idx`.
    pub fn lock_field(&self, idx: usize, field_off: usize, len: usize) -> Result<RegionGuard> {
        let start = (self.row_offset(idx) + field_off) as u64;
        lock_region(&self.file, start, len as u64, LockKind::Write)
            .map_err(|e| AfdError::io(format!("lock {}", self.path.display()), e))
    }

    /// Locks the header, serialising appends.
    pub fn lock_header(&self) -> Result<RegionGuard> {
        lock_region(&self.file, 0, HEADER_SIZE as u64, LockKind::Write)
            .map_err(|e| AfdError::io(format!("lock {}", self.path.display()), e))
    }

    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| AfdError::io(format!("flush {}", self.path.display()), e))
    }
}

pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(b)
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(b)
}

pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

pub fn get_i64(buf: &[u8], off: usize) -> i64 {
    get_u64(buf, off) as i64
}

pub fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    put_u64(buf, off, v as u64)
}

/// Reads a NUL padded ASCII field.
pub fn get_str(buf: &[u8], off: usize, len: usize) -> String {
    let field = &buf[off..off + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Writes `s` NUL padded; returns false when it does not fit.
pub fn put_str(buf: &mut [u8], off: usize, len: usize, s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() > len {
        return false;
    }
    let field = &mut buf[off..off + len];
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        let mut table = MappedTable::open(&path, "test table", 0xA5A5_0001, 1, 24).unwrap();
        assert_eq!(table.count(), 0);
        assert_eq!(table.capacity(), GROW_STEP);

        table.ensure_capacity(GROW_STEP + 1).unwrap();
        assert!(table.capacity() > GROW_STEP);

        put_u64(table.row_mut(GROW_STEP), 0, 42);
        table.set_count(GROW_STEP + 1);
        table.flush().unwrap();
        drop(table);

        let table = MappedTable::open(&path, "test table", 0xA5A5_0001, 1, 24).unwrap();
        assert_eq!(table.count(), GROW_STEP + 1);
        assert_eq!(get_u64(table.row(GROW_STEP), 0), 42);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        MappedTable::open(&path, "test table", 0xA5A5_0001, 1, 8).unwrap();
        let err = MappedTable::open(&path, "test table", 0xA5A5_0001, 2, 8)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn test_str_fields() {
        let mut buf = [0xffu8; 8];
        assert!(put_str(&mut buf, 0, 8, "abc"));
        assert_eq!(get_str(&buf, 0, 8), "abc");
        assert!(!put_str(&mut buf, 0, 8, "too long!"));
    }
}
