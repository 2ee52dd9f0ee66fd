//! Every on-disk location is derived from the single AFD work directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::logs::LogKind;

pub const WORK_DIR_ENV: &str = "AFD_WORK_DIR";
pub const DEFAULT_WORK_DIR: &str = "/var/lib/afd";

pub const DIR_NAME_FILE: &str = "directory_names";
pub const HOST_NAME_FILE: &str = "host_names";
pub const DIR_STATUS_FILE: &str = "dir_status";
pub const HOST_STATUS_FILE: &str = "host_status";
pub const COUNTER_FILE: &str = "unique_counter";
pub const PASSWORD_FILE: &str = "pwb_data";
pub const AFD_HOST_LIST_FILE: &str = "AFD_HOST_LIST";
pub const SYSTEM_LOG_NAME: &str = "amg.log";
pub const RECEIVE_LOG_NAME: &str = "RECEIVE_LOG";
pub const OPTIONS_FILE: &str = ".options";
pub const RULE_SET_FILE: &str = "rule_set.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AFD_WORK_DIR`, falling back to the packaged default.
    pub fn from_env() -> Self {
        let root = std::env::var_os(WORK_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifodir")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Staging area under a filesystem root (the work dir's `files/` by default).
    pub fn tmp_dir(fs_root: &Path) -> PathBuf {
        fs_root.join("tmp")
    }

    pub fn outgoing_dir(fs_root: &Path) -> PathBuf {
        fs_root.join("outgoing")
    }

    /// Jobs held back by a time filter, one subdirectory per job id.
    pub fn time_dir(fs_root: &Path) -> PathBuf {
        fs_root.join("time")
    }

    pub fn incoming_dir(&self, dir_id: u32) -> PathBuf {
        self.files_dir().join("incoming").join(format!("{:x}", dir_id))
    }

    /// Quarantine for duplicates handled with the STORE action.
    pub fn store_dir(&self, dir_id: u32) -> PathBuf {
        self.files_dir().join("store").join(format!("{:x}", dir_id))
    }

    pub fn crc_file(&self, dir_id: u32) -> PathBuf {
        self.files_dir().join("crc").join(format!("{:x}", dir_id))
    }

    pub fn rule_set_file(&self) -> PathBuf {
        self.fifo_dir().join(RULE_SET_FILE)
    }

    pub fn dir_name_file(&self) -> PathBuf {
        self.fifo_dir().join(DIR_NAME_FILE)
    }

    pub fn host_name_file(&self) -> PathBuf {
        self.fifo_dir().join(HOST_NAME_FILE)
    }

    pub fn dir_status_file(&self) -> PathBuf {
        self.fifo_dir().join(DIR_STATUS_FILE)
    }

    pub fn host_status_file(&self) -> PathBuf {
        self.fifo_dir().join(HOST_STATUS_FILE)
    }

    pub fn counter_file(&self) -> PathBuf {
        self.fifo_dir().join(COUNTER_FILE)
    }

    pub fn password_file(&self) -> PathBuf {
        self.fifo_dir().join(PASSWORD_FILE)
    }

    pub fn afd_host_list(&self) -> PathBuf {
        self.etc_dir().join(AFD_HOST_LIST_FILE)
    }

    pub fn system_log(&self) -> PathBuf {
        self.log_dir().join(SYSTEM_LOG_NAME)
    }

    pub fn receive_log(&self) -> PathBuf {
        self.log_dir().join(RECEIVE_LOG_NAME)
    }

    /// Log file `<kind>.<number>`; number 0 is the file being written.
    pub fn log_file(&self, kind: LogKind, number: u32) -> PathBuf {
        self.log_dir().join(format!("{}.{}", kind.base_name(), number))
    }

    pub fn create_all(&self) -> io::Result<()> {
        for dir in [
            self.etc_dir(),
            self.fifo_dir(),
            self.log_dir(),
            Self::tmp_dir(&self.files_dir()),
            Self::outgoing_dir(&self.files_dir()),
            Self::time_dir(&self.files_dir()),
            self.files_dir().join("incoming"),
            self.files_dir().join("store"),
            self.files_dir().join("crc"),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
