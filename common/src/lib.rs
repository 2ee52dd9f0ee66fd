pub mod crc32c;
pub mod error;
pub mod job;
pub mod lock;
pub mod logs;
pub mod mask;
pub mod mmap;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod rules;
pub mod status;

pub use error::{AfdError, ErrorKind, IoContext, Result};
pub use job::{JobKey, UniqueCounter};
pub use logs::LogKind;
pub use paths::WorkPaths;
pub use protocol::Protocol;
pub use registry::{NameEntry, NameRegistry};
pub use rules::{DirIdx, FileGroupIdx, DestGroupIdx, HostIdx, RecipientIdx, RuleSet};
pub use status::{dir_flags, host_flags, DirStatus, ScanCommit, StatusArea};

/// Maximum length of a directory or host alias.
pub const MAX_ALIAS_LENGTH: usize = 16;
