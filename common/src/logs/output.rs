use std::fmt;

use super::{parse_hex_u32, parse_hex_u64, sep_char, split_time};
use crate::error::{AfdError, Result};
use crate::job::JobKey;

const LOG: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Delivered = 0,
    AgeLimitDelete = 1,
    DuplicateStored = 2,
    DuplicateDelete = 3,
    OtherProcDelete = 4,
    AddressRejected = 5,
    HostDisabledDelete = 6,
    Duplicate = 7,
    Unknown = 8,
    Received = 9,
}

impl OutputType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => OutputType::Delivered,
            1 => OutputType::AgeLimitDelete,
            2 => OutputType::DuplicateStored,
            3 => OutputType::DuplicateDelete,
            4 => OutputType::OtherProcDelete,
            5 => OutputType::AddressRejected,
            6 => OutputType::HostDisabledDelete,
            7 => OutputType::Duplicate,
            8 => OutputType::Unknown,
            9 => OutputType::Received,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OutputType::Delivered => "delivered",
            OutputType::AgeLimitDelete => "age limit delete",
            OutputType::DuplicateStored => "duplicate stored",
            OutputType::DuplicateDelete => "duplicate delete",
            OutputType::OtherProcDelete => "other process delete",
            OutputType::AddressRejected => "address rejected",
            OutputType::HostDisabledDelete => "host disabled delete",
            OutputType::Duplicate => "duplicate",
            OutputType::Unknown => "unknown",
            OutputType::Received => "received",
        };
        f.write_str(text)
    }
}

/// `<hex-time> <host-alias> [<output-type> ][<current-toggle> ]<protocol-hex>
/// SEP <local-name> SEP <remote-name> SEP <hex-size> SEP <seconds> SEP
/// [<hex-retries> SEP]<hex-job-id> SEP <key>[ <mail-id>] [SEP <archive-dir>]`
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub time: i64,
    pub host_alias: String,
    pub output_type: Option<u8>,
    pub toggle: Option<u8>,
    pub protocol: u32,
    pub local_name: String,
    pub remote_name: String,
    pub size: u64,
    pub transmission_time: f64,
    pub retries: Option<u32>,
    pub job_id: u32,
    pub key: JobKey,
    pub mail_id: Option<String>,
    pub archive_dir: Option<String>,
}

impl OutputRecord {
    pub fn output_type(&self) -> Option<OutputType> {
        self.output_type.and_then(OutputType::from_code)
    }

    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        let mut line = format!("{:x} {}", self.time, self.host_alias);
        if let Some(t) = self.output_type {
            line.push_str(&format!(" {}", t));
        }
        if let Some(toggle) = self.toggle {
            line.push_str(&format!(" {}", toggle));
        }
        line.push_str(&format!(
            " {:x}{s}{}{s}{}{s}{:x}{s}{:.3}{s}",
            self.protocol, self.local_name, self.remote_name, self.size, self.transmission_time
        ));
        if let Some(retries) = self.retries {
            line.push_str(&format!("{:x}{s}", retries));
        }
        line.push_str(&format!("{:x}{s}{}", self.job_id, self.key));
        if let Some(mail_id) = &self.mail_id {
            line.push(' ');
            line.push_str(mail_id);
        }
        if let Some(archive) = &self.archive_dir {
            line.push(s);
            line.push_str(archive);
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

        let tokens: Vec<&str> = head.split_whitespace().collect();
        if tokens.len() < 2 || tokens.len() > 4 {
            return Err(AfdError::integrity(LOG, format!("bad header '{}'", head)));
        }
        let host_alias = tokens[0].to_string();
        let protocol = parse_hex_u32(tokens[tokens.len() - 1], LOG, "protocol")?;
        let digit = |t: &str| {
            t.parse::<u8>()
                .map_err(|_| AfdError::integrity(LOG, format!("bad type/toggle '{}'", t)))
        };
        let (output_type, toggle) = match tokens.len() {
            2 => (None, None),
            3 => (Some(digit(tokens[1])?), None),
            _ => (Some(digit(tokens[1])?), Some(digit(tokens[2])?)),
        };

        let parts: Vec<&str> = rest.split(sc).collect();
        if parts.len() < 6 {
            return Err(AfdError::integrity(LOG, format!("too few fields in '{}'", rest)));
        }
        let local_name = parts[0].to_string();
        let remote_name = parts[1].to_string();
        let size = parse_hex_u64(parts[2], LOG, "size")?;
        let transmission_time = parts[3]
            .parse::<f64>()
            .map_err(|_| AfdError::integrity(LOG, format!("bad transmission time '{}'", parts[3])))?;

        let tail = &parts[4..];
        let (retries, job_field, key_field, archive) = if tail.len() >= 2 && tail[1].contains('_') {
            (None, tail[0], tail[1], &tail[2..])
        } else if tail.len() >= 3 {
            (Some(parse_hex_u32(tail[0], LOG, "retries")?), tail[1], tail[2], &tail[3..])
        } else {
            return Err(AfdError::integrity(LOG, "missing job key"));
        };

        let job_id = parse_hex_u32(job_field, LOG, "job id")?;
        let (key_text, mail_id) = match key_field.split_once(' ') {
            Some((k, m)) => (k, Some(m.to_string())),
            None => (key_field, None),
        };
        let key: JobKey = key_text.parse().map_err(|e: String| AfdError::integrity(LOG, e))?;
        let archive_dir = if archive.is_empty() {
            None
        } else {
            Some(archive.join(&sc.to_string()))
        };

        Ok(OutputRecord {
            time,
            host_alias,
            output_type,
            toggle,
            protocol,
            local_name,
            remote_name,
            size,
            transmission_time,
            retries,
            job_id,
            key,
            mail_id,
            archive_dir,
        })
    }
}
