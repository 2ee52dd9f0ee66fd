//! Password store `fifodir/pwb_data`.
//!
//! Passwords found in recipient and remote-directory URLs are moved here
//! during a reload so the rule set itself never carries them. The file is
//! 0600 and rewritten under an exclusive fcntl lock.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use common::lock::{lock_region, LockKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordStore {
    /// `"<user>@<host-alias>"` to password.
    entries: BTreeMap<String, String>,
}

fn key(user: &str, host_alias: &str) -> String {
    format!("{}@{}", user, host_alias)
}

impl PasswordStore {
    pub fn insert(&mut self, user: &str, host_alias: &str, password: &str) {
        self.entries.insert(key(user, host_alias), password.to_string());
    }

    pub fn lookup(&self, user: &str, host_alias: &str) -> Option<&str> {
        self.entries.get(&key(user, host_alias)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open password store {:?}", path))
    }

    /// Replaces the whole store on disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = Self::open(path)?;
        let len = file.metadata()?.len().max(1);
        let _guard = lock_region(&file, 0, len, LockKind::Write)
            .with_context(|| format!("Failed to lock password store {:?}", path))?;
        let data = serde_json::to_vec(self)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut file = Self::open(path)?;
        let len = file.metadata()?.len().max(1);
        let _guard = lock_region(&file, 0, len, LockKind::Read)
            .with_context(|| format!("Failed to lock password store {:?}", path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse password store {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_save_load_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwb_data");
        let mut store = PasswordStore::default();
        store.insert("anon", "hostA", "secret");
        store.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = PasswordStore::load(&path).unwrap();
        assert_eq!(loaded.lookup("anon", "hostA"), Some("secret"));
        assert_eq!(loaded.lookup("anon", "hostB"), None);

        PasswordStore::default().save(&path).unwrap();
        assert!(PasswordStore::load(&path).unwrap().is_empty());
    }
}
