//! `etc/AFD_HOST_LIST`: the other AFDs a trace may continue into.
//!
//! One AFD per line: `<alias> <work-dir> [<hostname>]`. Blank lines and
//! lines starting with `#` are ignored.

use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use common::crc32c::crc32c;

/// Id of the AFD rooted at `work_dir`, as printed by `%H`.
pub fn afd_id(work_dir: &Path) -> u32 {
    crc32c(work_dir.as_os_str().as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfdHost {
    pub alias: String,
    pub work_dir: PathBuf,
    pub hostname: Option<String>,
}

impl AfdHost {
    /// CRC32C of the work directory path.
    pub fn id(&self) -> u32 {
        afd_id(&self.work_dir)
    }

    /// Matches `%alias`, `#hex-id`, or a bare alias or hostname.
    pub fn matches(&self, spec: &str) -> bool {
        if let Some(alias) = spec.strip_prefix('%') {
            return self.alias == alias;
        }
        if let Some(id) = spec.strip_prefix('#') {
            return u32::from_str_radix(id, 16).map_or(false, |id| id == self.id());
        }
        self.alias == spec || self.hostname.as_deref() == Some(spec)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostList {
    pub hosts: Vec<AfdHost>,
}

impl HostList {
    pub fn parse(text: &str) -> Result<Self> {
        let mut hosts = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                bail!("AFD_HOST_LIST line {}: expected '<alias> <work-dir> [<hostname>]'", n + 1);
            }
            hosts.push(AfdHost {
                alias: fields[0].to_string(),
                work_dir: PathBuf::from(fields[1]),
                hostname: fields.get(2).map(|h| h.to_string()),
            });
        }
        Ok(Self { hosts })
    }

    /// A missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn find(&self, spec: &str) -> Option<&AfdHost> {
        self.hosts.iter().find(|h| h.matches(spec))
    }

    pub fn by_alias(&self, alias: &str) -> Option<&AfdHost> {
        self.hosts.iter().find(|h| h.alias == alias)
    }
}
