//! Name/id registries: directory paths and host aliases.
//!
//! Known names keep their id across reloads; new names are appended and get
//! the CRC32C of their key, incremented past any id already in use. Only the
//! supervisor registers; every other process attaches read-only in practice.

use std::path::Path;

use crate::crc32c::crc32c;
use crate::error::{AfdError, Result};
use crate::mmap::{get_str, get_u32, put_str, put_u32, MappedTable};

const VERSION: u8 = 1;

const OFF_ID: usize = 0;
const OFF_LABEL: usize = 8;
const LABEL_LEN: usize = 32;
const OFF_KEY: usize = OFF_LABEL + LABEL_LEN;

#[derive(Debug, Clone, Copy)]
struct Layout {
    what: &'static str,
    magic: u32,
    key_len: usize,
}

const DIR_LAYOUT: Layout = Layout {
    what: "directory name registry",
    magic: 0x4146_444e,
    key_len: 1024,
};

const HOST_LAYOUT: Layout = Layout {
    what: "host name registry",
    magic: 0x4146_4848,
    key_len: 256,
};

/// One registry row. For directories `key` is the absolute path and
/// `label` the alias; for hosts `key` is the alias and `label` the real
/// hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub id: u32,
    pub key: String,
    pub label: String,
}

pub struct NameRegistry {
    table: MappedTable,
    layout: Layout,
}

impl NameRegistry {
    pub fn attach_dirs(path: &Path) -> Result<Self> {
        Self::attach(path, DIR_LAYOUT)
    }

    pub fn attach_hosts(path: &Path) -> Result<Self> {
        Self::attach(path, HOST_LAYOUT)
    }

    fn attach(path: &Path, layout: Layout) -> Result<Self> {
        let table = MappedTable::open(
            path,
            layout.what,
            layout.magic,
            VERSION,
            OFF_KEY + layout.key_len,
        )?;
        Ok(Self { table, layout })
    }

    pub fn detach(self) {}

    pub fn len(&self) -> usize {
        self.table.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, idx: usize) -> NameEntry {
        let row = self.table.row(idx);
        NameEntry {
            id: get_u32(row, OFF_ID),
            label: get_str(row, OFF_LABEL, LABEL_LEN),
            key: get_str(row, OFF_KEY, self.layout.key_len),
        }
    }

    pub fn entries(&mut self) -> Result<Vec<NameEntry>> {
        self.table.refresh()?;
        Ok((0..self.len()).map(|i| self.entry(i)).collect())
    }

    pub fn lookup_key(&self, key: &str) -> Option<NameEntry> {
        (0..self.len()).map(|i| self.entry(i)).find(|e| e.key == key)
    }

    pub fn lookup_id(&self, id: u32) -> Option<NameEntry> {
        (0..self.len()).map(|i| self.entry(i)).find(|e| e.id == id)
    }

    pub fn lookup_label(&self, label: &str) -> Vec<NameEntry> {
        (0..self.len())
            .map(|i| self.entry(i))
            .filter(|e| e.label == label)
            .collect()
    }

    /// Returns the id of `key`, appending it when unknown. An existing row
    /// whose label changed is updated in place.
    pub fn register(&mut self, key: &str, label: &str) -> Result<u32> {
        if key.len() > self.layout.key_len || label.len() > LABEL_LEN {
            return Err(AfdError::config(
                self.layout.what,
                format!("name '{}' ({}) too long", key, label),
            ));
        }
        let _guard = self.table.lock_header()?;
        self.table.refresh()?;

        let count = self.len();
        for idx in 0..count {
            let entry = self.entry(idx);
            if entry.key == key {
                if entry.label != label {
                    put_str(self.table.row_mut(idx), OFF_LABEL, LABEL_LEN, label);
                }
                return Ok(entry.id);
            }
        }

        let mut id = crc32c(key.as_bytes());
        while (0..count).any(|i| get_u32(self.table.row(i), OFF_ID) == id) {
            log::debug!("Id {:x} of '{}' already taken, trying next", id, key);
            id = id.wrapping_add(1);
        }

        self.table.ensure_capacity(count + 1)?;
        let key_len = self.layout.key_len;
        let row = self.table.row_mut(count);
        row.fill(0);
        put_u32(row, OFF_ID, id);
        put_str(row, OFF_LABEL, LABEL_LEN, label);
        put_str(row, OFF_KEY, key_len, key);
        self.table.set_count(count + 1);
        self.table.flush()?;
        log::info!("Registered {} '{}' as {:x}", self.layout.what, key, id);
        Ok(id)
    }
}
