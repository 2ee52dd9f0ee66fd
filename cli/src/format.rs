//! The `-o` output language.
//!
//! `%[-][width]<section><field>[<subtype>]` where section is one of
//! `I U P O D` (the log a value comes from) or `A` (this AFD). `%%`
//! prints a percent sign, `\n` and `\t` the usual characters. A value
//! from a section the trace does not have prints as an empty string,
//! padded to the width.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::{bail, Result};
use chrono::{Local, TimeZone};
use common::logs::{DeleteReason, LogKind, OutputType};
use common::Protocol;

use crate::search::Trace;

pub const DEFAULT_FORMAT: &str = "%ITm%ITd %ITH:%ITM:%ITS %-20IF %12ISk %-8UDx %-12OH %OSk %OE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Log(LogKind),
    Afd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    section: Section,
    field: char,
    subtype: Option<char>,
    left: bool,
    width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Text(String),
    Value(Placeholder),
}

const TIME_SUBTYPES: &str = "uxaAbBdHjmMSyY";
const SIZE_SUBTYPES: &str = "bxkmg";

fn fields(section: Section) -> &'static str {
    match section {
        Section::Log(LogKind::Input) => "TFSDU",
        Section::Log(LogKind::Distribution) => "TFSDUYJN",
        Section::Log(LogKind::Production) => "TFNSOECXJK",
        Section::Log(LogKind::Output) => "TFRSEHPYZJKA",
        Section::Log(LogKind::Delete) => "TFSHRJKWXD",
        Section::Log(LogKind::Event) => "",
        Section::Afd => "A",
    }
}

/// Subtype letters a field takes, if any.
fn subtypes(field: char) -> &'static str {
    match field {
        'T' => TIME_SUBTYPES,
        'S' | 'O' => SIZE_SUBTYPES,
        'D' => "xa",
        'R' | 'C' | 'J' => "x",
        _ => "",
    }
}

/// A parsed `-o` string plus what it needs to print directory aliases.
#[derive(Debug, Clone)]
pub struct Format {
    items: Vec<Item>,
    dir_aliases: HashMap<u32, String>,
}

impl Format {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut items = Vec::new();
        let mut text = String::new();
        let mut chars = spec.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('\\') => text.push('\\'),
                    Some(other) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => text.push('\\'),
                },
                '%' => {
                    if chars.peek() == Some(&'%') {
                        chars.next();
                        text.push('%');
                        continue;
                    }
                    let left = chars.next_if_eq(&'-').is_some();
                    let mut width = 0usize;
                    while let Some(d) = chars.next_if(|c| c.is_ascii_digit()) {
                        width = width * 10 + (d as usize - '0' as usize);
                    }
                    let section = match chars.next() {
                        Some('I') => Section::Log(LogKind::Input),
                        Some('U') => Section::Log(LogKind::Distribution),
                        Some('P') => Section::Log(LogKind::Production),
                        Some('O') => Section::Log(LogKind::Output),
                        Some('D') => Section::Log(LogKind::Delete),
                        Some('A') => Section::Afd,
                        Some(other) => bail!("Unknown section '{}' in format '{}'", other, spec),
                        None => bail!("Format '{}' ends inside a placeholder", spec),
                    };
                    let field = match chars.next() {
                        Some(f) if fields(section).contains(f) => f,
                        Some(f) => bail!("Unknown field '{}' for this section in format '{}'", f, spec),
                        None => bail!("Format '{}' ends inside a placeholder", spec),
                    };
                    let subtype = match section {
                        Section::Afd => None,
                        Section::Log(_) => chars.next_if(|c| subtypes(field).contains(*c)),
                    };
                    if !text.is_empty() {
                        items.push(Item::Text(std::mem::take(&mut text)));
                    }
                    items.push(Item::Value(Placeholder {
                        section,
                        field,
                        subtype,
                        left,
                        width,
                    }));
                }
                c => text.push(c),
            }
        }
        if !text.is_empty() {
            items.push(Item::Text(text));
        }
        Ok(Self {
            items,
            dir_aliases: HashMap::new(),
        })
    }

    pub fn with_dir_aliases(mut self, aliases: HashMap<u32, String>) -> Self {
        self.dir_aliases = aliases;
        self
    }

    /// One output line (without the newline).
    pub fn render(&self, trace: &Trace) -> String {
        let mut line = String::new();
        for item in &self.items {
            match item {
                Item::Text(t) => line.push_str(t),
                Item::Value(p) => {
                    let value = self.value(p, trace).unwrap_or_default();
                    let _ = if p.left {
                        write!(line, "{:<w$}", value, w = p.width)
                    } else {
                        write!(line, "{:>w$}", value, w = p.width)
                    };
                }
            }
        }
        line
    }

    fn dir(&self, id: u32, subtype: Option<char>) -> String {
        match subtype {
            Some('a') => self.dir_aliases.get(&id).cloned().unwrap_or_else(|| format!("{:x}", id)),
            _ => format!("{:x}", id),
        }
    }

    fn value(&self, p: &Placeholder, trace: &Trace) -> Option<String> {
        let sub = p.subtype;
        let key = |k: common::JobKey| k.to_string();
        let job = |j: u32| format!("{:x}", j);
        Some(match p.section {
            Section::Afd => trace.afd.clone(),
            Section::Log(LogKind::Input) => {
                let r = trace.input.as_ref()?;
                match p.field {
                    'T' => time(r.time, sub),
                    'F' => r.filename.clone(),
                    'S' => size(r.size, sub),
                    'D' => self.dir(r.dir_id, sub),
                    'U' => format!("{:x}", r.unique_number),
                    _ => return None,
                }
            }
            Section::Log(LogKind::Distribution) => {
                let r = trace.distribution.as_ref()?;
                match p.field {
                    'T' => time(r.time, sub),
                    'F' => r.filename.clone(),
                    'S' => size(r.size, sub),
                    'D' => self.dir(r.dir_id, sub),
                    'U' => format!("{:x}", r.unique_number),
                    'Y' => r.dis_type.describe().to_string(),
                    'J' => r.jobs.iter().map(|(j, _)| job(*j)).collect::<Vec<_>>().join(","),
                    'N' => r.jobs.len().to_string(),
                    _ => return None,
                }
            }
            Section::Log(LogKind::Production) => {
                let first = trace.production.first()?;
                let last = trace.production.last()?;
                match p.field {
                    'T' => time(last.time, sub),
                    'F' => first.original_name.clone(),
                    'N' => last.new_name.clone(),
                    'S' => size(last.new_size, sub),
                    'O' => size(first.original_size?, sub),
                    'E' => last.timing?.duration.to_string(),
                    'C' => match sub {
                        Some('x') => format!("{:x}", last.return_code),
                        _ => last.return_code.to_string(),
                    },
                    'X' => last.command.clone(),
                    'J' => job(last.job_id),
                    'K' => key(last.key),
                    _ => return None,
                }
            }
            Section::Log(LogKind::Output) => {
                let r = trace.output.as_ref()?;
                match p.field {
                    'T' => time(r.time, sub),
                    'F' => r.local_name.clone(),
                    'R' => r.remote_name.clone(),
                    'S' => size(r.size, sub),
                    'E' => format!("{:.3}", r.transmission_time),
                    'H' => r.host_alias.clone(),
                    'P' => Protocol::from_bit(r.protocol)
                        .map(|p| p.scheme().to_string())
                        .unwrap_or_else(|| format!("{:x}", r.protocol)),
                    'Y' => r.output_type().map(|t| t.to_string()).unwrap_or_else(|| OutputType::Delivered.to_string()),
                    'Z' => r.retries.unwrap_or(0).to_string(),
                    'J' => job(r.job_id),
                    'K' => key(r.key),
                    'A' => r.archive_dir.clone().unwrap_or_default(),
                    _ => return None,
                }
            }
            Section::Log(LogKind::Delete) => {
                let r = trace.delete.as_ref()?;
                match p.field {
                    'T' => time(r.time, sub),
                    'F' => r.filename.clone(),
                    'S' => size(r.size, sub),
                    'H' => r.host_alias.clone().unwrap_or_else(|| "-".to_string()),
                    'R' => match (sub, DeleteReason::from_code(r.reason)) {
                        (None, Some(reason)) => reason.describe().to_string(),
                        _ => format!("{:x}", r.reason),
                    },
                    'J' => job(r.job_id),
                    'K' => key(r.key()?),
                    'W' => r.user.clone(),
                    'X' => r.additional.clone().unwrap_or_default(),
                    'D' => self.dir(r.dir_id()?, sub),
                    _ => return None,
                }
            }
            Section::Log(LogKind::Event) => return None,
        })
    }
}

/// Record time in local time, `%Y-%m-%d %H:%M:%S` unless a subtype
/// picks one part.
fn time(t: i64, subtype: Option<char>) -> String {
    match subtype {
        Some('u') => return t.to_string(),
        Some('x') => return format!("{:x}", t),
        _ => {}
    }
    let Some(local) = Local.timestamp_opt(t, 0).single() else {
        return format!("{:x}", t);
    };
    match subtype {
        Some(c) => local.format(&format!("%{}", c)).to_string(),
        None => local.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

fn size(bytes: u64, subtype: Option<char>) -> String {
    const KB: f64 = 1024.0;
    match subtype {
        Some('x') => format!("{:x}", bytes),
        Some('k') => format!("{:.2}", bytes as f64 / KB),
        Some('m') => format!("{:.2}", bytes as f64 / (KB * KB)),
        Some('g') => format!("{:.2}", bytes as f64 / (KB * KB * KB)),
        _ => bytes.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::logs::{DeleteRecord, InputRecord, OutputRecord};
    use common::JobKey;

    fn trace() -> Trace {
        Trace {
            afd: "hub".into(),
            input: Some(InputRecord {
                time: 0x6000_0000,
                filename: "hello.txt".into(),
                size: 2048,
                dir_id: 0x1f,
                unique_number: 3,
            }),
            output: Some(OutputRecord {
                time: 0x6000_0010,
                host_alias: "edge".into(),
                output_type: Some(0),
                toggle: Some(1),
                protocol: Protocol::Sftp.bit(),
                local_name: "hello.txt".into(),
                remote_name: "HELLO.TXT".into(),
                size: 2048,
                transmission_time: 0.5,
                retries: Some(2),
                job_id: 0xab,
                key: JobKey::new(0x6000_0000, 3, 0),
                mail_id: None,
                archive_dir: None,
            }),
            ..Trace::default()
        }
    }

    #[test]
    fn test_golden_line() {
        let format = Format::parse("%ITx|%ITu|%-12IF|%6ISk|%IDa|%OH %OP %OR %OE %OZ %OK|%A %%\\t.")
            .unwrap()
            .with_dir_aliases([(0x1f, "inbox".to_string())].into_iter().collect());
        assert_eq!(
            format.render(&trace()),
            "60000000|1610612736|hello.txt   |  2.00|inbox|edge sftp HELLO.TXT 0.500 2 60000000_3_0|hub %\t."
        );
    }

    #[test]
    fn test_missing_sections_pad() {
        let format = Format::parse("[%5PN][%-4DR][%UN]").unwrap();
        assert_eq!(format.render(&trace()), "[     ][    ][]");

        let mut t = trace();
        t.delete = Some(DeleteRecord {
            time: 0x6000_0020,
            host_alias: None,
            reason: DeleteReason::DupInput.code(),
            filename: "hello.txt".into(),
            size: 2048,
            job_id: 0,
            origin: Some((0x1f, JobKey::new(0x6000_0020, 0, 0))),
            user: "dir_check".into(),
            additional: None,
        });
        let format = Format::parse("%DH %DRx %DD %DW").unwrap();
        assert_eq!(format.render(&t), "- 5 1f dir_check");
    }

    #[test]
    fn test_rejects_bad_placeholders() {
        assert!(Format::parse("%Q").is_err());
        assert!(Format::parse("%IZ").is_err());
        assert!(Format::parse("%-12").is_err());
        assert!(Format::parse(DEFAULT_FORMAT).is_ok());
    }
}
