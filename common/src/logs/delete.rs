use std::fmt;

use super::{parse_hex_u32, parse_hex_u64, sep_char, split_time};
use crate::error::{AfdError, Result};
use crate::job::JobKey;

const LOG: &str = "delete";

/// Host alias written when no host is involved (pickup-time deletes).
pub const NO_HOST: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteReason {
    AgeOutput = 0x0,
    AgeInput = 0x1,
    UserDelete = 0x2,
    ExecFailed = 0x3,
    NoMessageFile = 0x4,
    DupInput = 0x5,
    DupOutput = 0x6,
    UnknownFile = 0x7,
    JidLookupFailure = 0x8,
    OldLockedFile = 0x9,
    QueuedFile = 0xa,
    DeleteOption = 0xb,
    StaleErrorJob = 0xc,
    StaleMessage = 0xd,
    FileCurrentlyTransmitted = 0xe,
    UnknownPoolDir = 0xf,
    ExecFailedStored = 0x10,
    HostDisabled = 0x11,
    ConversionFailed = 0x12,
    RenameOverwrite = 0x13,
    RecipientRejected = 0x14,
    MirrorRemove = 0x15,
    MkdirQueueError = 0x16,
    InternalLinkFailed = 0x17,
    UnreadableFile = 0x18,
}

impl DeleteReason {
    const ALL: [DeleteReason; 25] = [
        DeleteReason::AgeOutput,
        DeleteReason::AgeInput,
        DeleteReason::UserDelete,
        DeleteReason::ExecFailed,
        DeleteReason::NoMessageFile,
        DeleteReason::DupInput,
        DeleteReason::DupOutput,
        DeleteReason::UnknownFile,
        DeleteReason::JidLookupFailure,
        DeleteReason::OldLockedFile,
        DeleteReason::QueuedFile,
        DeleteReason::DeleteOption,
        DeleteReason::StaleErrorJob,
        DeleteReason::StaleMessage,
        DeleteReason::FileCurrentlyTransmitted,
        DeleteReason::UnknownPoolDir,
        DeleteReason::ExecFailedStored,
        DeleteReason::HostDisabled,
        DeleteReason::ConversionFailed,
        DeleteReason::RenameOverwrite,
        DeleteReason::RecipientRejected,
        DeleteReason::MirrorRemove,
        DeleteReason::MkdirQueueError,
        DeleteReason::InternalLinkFailed,
        DeleteReason::UnreadableFile,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn describe(self) -> &'static str {
        match self {
            DeleteReason::AgeOutput => "Age limit (output)",
            DeleteReason::AgeInput => "Age limit (input)",
            DeleteReason::UserDelete => "Deleted by user",
            DeleteReason::ExecFailed => "Exec failed",
            DeleteReason::NoMessageFile => "No message file",
            DeleteReason::DupInput => "Duplicate input",
            DeleteReason::DupOutput => "Duplicate output",
            DeleteReason::UnknownFile => "Unknown file",
            DeleteReason::JidLookupFailure => "Job id lookup failure",
            DeleteReason::OldLockedFile => "Old locked file",
            DeleteReason::QueuedFile => "Queued file",
            DeleteReason::DeleteOption => "Delete option",
            DeleteReason::StaleErrorJob => "Stale error job",
            DeleteReason::StaleMessage => "Stale message",
            DeleteReason::FileCurrentlyTransmitted => "File currently transmitted",
            DeleteReason::UnknownPoolDir => "Unknown pool directory",
            DeleteReason::ExecFailedStored => "Exec failed, stored",
            DeleteReason::HostDisabled => "Host disabled",
            DeleteReason::ConversionFailed => "Conversion failed",
            DeleteReason::RenameOverwrite => "Overwritten by rename",
            DeleteReason::RecipientRejected => "Recipient rejected",
            DeleteReason::MirrorRemove => "Mirror remove",
            DeleteReason::MkdirQueueError => "Failed to create queue",
            DeleteReason::InternalLinkFailed => "Internal link failed",
            DeleteReason::UnreadableFile => "Unreadable file",
        }
    }
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// `<hex-time> <host-alias>|- <hex-reason> SEP <filename> SEP <hex-size> SEP
/// <hex-job-id> SEP [<hex-dir-id> SEP <key> SEP]<user-or-process>
/// [SEP <additional-reason>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub time: i64,
    /// `None` is written as `-`.
    pub host_alias: Option<String>,
    pub reason: u32,
    pub filename: String,
    pub size: u64,
    pub job_id: u32,
    pub origin: Option<(u32, JobKey)>,
    pub user: String,
    pub additional: Option<String>,
}

impl DeleteRecord {
    pub fn reason(&self) -> Option<DeleteReason> {
        DeleteReason::from_code(self.reason)
    }

    pub fn dir_id(&self) -> Option<u32> {
        self.origin.map(|(dir_id, _)| dir_id)
    }

    pub fn key(&self) -> Option<JobKey> {
        self.origin.map(|(_, key)| key)
    }

    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        let mut line = format!(
            "{:x} {} {:x}{s}{}{s}{:x}{s}{:x}{s}",
            self.time,
            self.host_alias.as_deref().unwrap_or(NO_HOST),
            self.reason,
            self.filename,
            self.size,
            self.job_id
        );
        if let Some((dir_id, key)) = &self.origin {
            line.push_str(&format!("{:x}{s}{}{s}", dir_id, key));
        }
        line.push_str(&self.user);
        if let Some(additional) = &self.additional {
            line.push(s);
            line.push_str(additional);
        }
        line.push('\n');
        line
    }

    pub fn parse(line: &str, sep: u8) -> Result<Self> {
        let (time, rest) = split_time(line, LOG)?;
        let sc = sep_char(sep);
        let (head, rest) = rest
            .split_once(sc)
            .ok_or_else(|| AfdError::integrity(LOG, "missing separator"))?;
        let (alias, reason) = head
            .split_once(' ')
            .ok_or_else(|| AfdError::integrity(LOG, format!("bad header '{}'", head)))?;
        let host_alias = if alias == NO_HOST {
            None
        } else {
            Some(alias.to_string())
        };
        let reason = parse_hex_u32(reason.trim(), LOG, "reason")?;

        let fields: Vec<&str> = rest.split(sc).collect();
        if fields.len() < 4 {
            return Err(AfdError::integrity(LOG, format!("too few fields in '{}'", rest)));
        }
        let filename = fields[0].to_string();
        let size = parse_hex_u64(fields[1], LOG, "size")?;
        let job_id = parse_hex_u32(fields[2], LOG, "job id")?;

        let origin = if fields.len() >= 6 {
            match (u32::from_str_radix(fields[3], 16), fields[4].parse::<JobKey>()) {
                (Ok(dir_id), Ok(key)) => Some((dir_id, key)),
                _ => None,
            }
        } else {
            None
        };
        let tail = if origin.is_some() { &fields[5..] } else { &fields[3..] };
        let user = tail[0].to_string();
        let additional = if tail.len() > 1 {
            Some(tail[1..].join(&sc.to_string()))
        } else {
            None
        };

        Ok(DeleteRecord {
            time,
            host_alias,
            reason,
            filename,
            size,
            job_id,
            origin,
            user,
            additional,
        })
    }
}
