//! Moving accepted files into a staging directory.
//!
//! Same filesystem means one rename. Otherwise the file is copied and the
//! source unlinked; the copy is handed to the AFD user with chown, but only
//! when the process actually holds CAP_CHOWN.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use nix::unistd::{chown, getegid, geteuid};

const CAP_CHOWN: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Renamed,
    Copied,
}

#[derive(Debug)]
pub enum MoveError {
    /// The source vanished before it could be moved.
    SourceMissing(io::Error),
    /// The staging directory is gone.
    DestinationMissing(io::Error),
    Other(io::Error),
}

impl MoveError {
    pub fn is_no_space(&self) -> bool {
        matches!(self, MoveError::Other(e) if e.raw_os_error() == Some(libc::ENOSPC))
    }
}

impl std::fmt::Display for MoveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveError::SourceMissing(e) => write!(f, "source missing: {}", e),
            MoveError::DestinationMissing(e) => write!(f, "destination missing: {}", e),
            MoveError::Other(e) => write!(f, "{}", e),
        }
    }
}

fn classify(err: io::Error, src: &Path, dst: &Path) -> MoveError {
    if err.kind() != io::ErrorKind::NotFound {
        return MoveError::Other(err);
    }
    if fs::symlink_metadata(src).is_err() {
        MoveError::SourceMissing(err)
    } else if dst.parent().map_or(true, |p| !p.is_dir()) {
        MoveError::DestinationMissing(err)
    } else {
        MoveError::Other(err)
    }
}

/// Whether CAP_CHOWN is in the effective capability set.
pub fn holds_cap_chown() -> bool {
    let Ok(status) = fs::read_to_string("/proc/self/status") else {
        return false;
    };
    status
        .lines()
        .find_map(|l| l.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
        .map_or(false, |caps| caps & (1 << CAP_CHOWN) != 0)
}

#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    pub force_copy: bool,
    pub cap_chown: bool,
}

impl Migrator {
    pub fn new(force_copy: bool) -> Self {
        Self {
            force_copy,
            cap_chown: holds_cap_chown(),
        }
    }

    /// Moves `src` to `dst`. `same_dev` says whether both live on one filesystem.
    pub fn move_file(&self, src: &Path, dst: &Path, same_dev: bool) -> Result<Method, MoveError> {
        if same_dev && !self.force_copy {
            match fs::rename(src, dst) {
                Ok(()) => return Ok(Method::Renamed),
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {}
                Err(e) => return Err(classify(e, src, dst)),
            }
        }
        self.copy_then_unlink(src, dst)?;
        Ok(Method::Copied)
    }

    fn copy_then_unlink(&self, src: &Path, dst: &Path) -> Result<(), MoveError> {
        let meta = fs::metadata(src).map_err(|e| classify(e, src, dst))?;
        if let Err(e) = fs::copy(src, dst) {
            let _ = fs::remove_file(dst);
            return Err(classify(e, src, dst));
        }
        let mtime = UNIX_EPOCH + Duration::from_secs(meta.mtime().max(0) as u64);
        if let Err(e) = File::options().write(true).open(dst).and_then(|f| f.set_modified(mtime)) {
            log::debug!("Failed to keep mtime of {}: {}", dst.display(), e);
        }
        self.adopt(dst, &meta);
        if let Err(e) = fs::remove_file(src) {
            // Keep exactly one copy visible.
            let _ = fs::remove_file(dst);
            return Err(classify(e, src, dst));
        }
        Ok(())
    }

    fn adopt(&self, dst: &Path, source_meta: &fs::Metadata) {
        let (uid, gid) = (geteuid(), getegid());
        if !self.cap_chown || (source_meta.uid() == uid.as_raw() && source_meta.gid() == gid.as_raw()) {
            return;
        }
        if let Err(e) = chown(dst, Some(uid), Some(gid)) {
            log::warn!("Failed to chown {}: {}", dst.display(), e);
        }
    }
}
