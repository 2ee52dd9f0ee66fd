//! The lineage log streams.
//!
//! Every record starts with the hex seconds since the epoch followed by a
//! space; the remaining fields are separated by a configurable byte
//! (`|` by default). Numeric fields are unpadded lower case hex unless a
//! record type says otherwise.

pub mod delete;
pub mod distribution;
pub mod event;
pub mod input;
pub mod output;
pub mod production;
pub mod reader;
pub mod writer;

pub use delete::{DeleteReason, DeleteRecord};
pub use distribution::{DistributionRecord, DistributionType};
pub use event::{EventAction, EventClass, EventRecord};
pub use input::InputRecord;
pub use output::{OutputRecord, OutputType};
pub use production::{ProductionRecord, ProductionTiming};
pub use reader::{LogFollower, LogLine, LogSegment, SegmentLines};
pub use writer::{log_path, LogPolicy, LogSet, LogWriter};

use crate::error::{AfdError, Result};

pub const DEFAULT_SEPARATOR: u8 = b'|';

/// Writes larger than this are serialised with an fcntl lock instead of
/// relying on atomic O_APPEND.
pub const PIPE_BUF: usize = libc::PIPE_BUF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogKind {
    Input,
    Distribution,
    Production,
    Output,
    Delete,
    Event,
}

impl LogKind {
    pub const LINEAGE: [LogKind; 5] = [
        LogKind::Input,
        LogKind::Distribution,
        LogKind::Production,
        LogKind::Output,
        LogKind::Delete,
    ];

    pub fn base_name(self) -> &'static str {
        match self {
            LogKind::Input => "INPUT_LOG",
            LogKind::Distribution => "DISTRIBUTION_LOG",
            LogKind::Production => "PRODUCTION_LOG",
            LogKind::Output => "OUTPUT_LOG",
            LogKind::Delete => "DELETE_LOG",
            LogKind::Event => "EVENT_LOG",
        }
    }

    /// Name used in diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            LogKind::Input => "input",
            LogKind::Distribution => "distribution",
            LogKind::Production => "production",
            LogKind::Output => "output",
            LogKind::Delete => "delete",
            LogKind::Event => "event",
        }
    }

    /// Letter used by `alda -L`.
    pub fn letter(self) -> char {
        match self {
            LogKind::Input => 'I',
            LogKind::Distribution => 'U',
            LogKind::Production => 'P',
            LogKind::Output => 'O',
            LogKind::Delete => 'D',
            LogKind::Event => 'E',
        }
    }
}

pub(crate) fn parse_hex_u64(field: &str, log: &'static str, what: &str) -> Result<u64> {
    u64::from_str_radix(field, 16)
        .map_err(|_| AfdError::integrity(log, format!("{} '{}' is not hex", what, field)))
}

pub(crate) fn parse_hex_u32(field: &str, log: &'static str, what: &str) -> Result<u32> {
    u32::from_str_radix(field, 16)
        .map_err(|_| AfdError::integrity(log, format!("{} '{}' is not hex", what, field)))
}

pub(crate) fn parse_hex_time(field: &str, log: &'static str) -> Result<i64> {
    parse_hex_u64(field, log, "time").map(|t| t as i64)
}

/// Splits `<hex-time> <rest>` and strips the trailing newline.
pub(crate) fn split_time<'a>(line: &'a str, log: &'static str) -> Result<(i64, &'a str)> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let (time, rest) = line
        .split_once(' ')
        .ok_or_else(|| AfdError::integrity(log, "missing time field"))?;
    Ok((parse_hex_time(time, log)?, rest))
}

pub(crate) fn sep_char(sep: u8) -> char {
    sep as char
}

/// Cheap time extraction used to pre-filter files and cache positions
/// without parsing full records.
pub fn record_time(line: &str) -> Option<i64> {
    let end = line.find(|c: char| c == ' ' || c == ':')?;
    i64::from_str_radix(&line[..end], 16).ok()
}
