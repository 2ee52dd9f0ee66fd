//! The routing rule set: directory entries, file groups, destination
//! groups, recipients and hosts.
//!
//! All entities live in flat vectors and refer to each other by index, so
//! the graph can be cyclic (a host knows its recipients, a recipient its
//! host) without shared ownership. One `RuleSet` is one configuration
//! generation; the supervisor writes it to `fifodir/` and the pickup
//! workers load it from there.

use std::fmt;
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AfdError, IoContext, Result};
use crate::mask::FileMask;
use crate::protocol::Protocol;

macro_rules! index_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn get(self) -> usize {
                self.0 as usize
            }
        }
    };
}

index_type!(DirIdx);
index_type!(FileGroupIdx);
index_type!(DestGroupIdx);
index_type!(RecipientIdx);
index_type!(HostIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Less,
    Greater,
    Equal,
    NotEqual,
}

impl Comparator {
    /// Splits an optional `<`, `>`, `=` or `!` prefix off `text`; no prefix
    /// means equality.
    pub fn split_prefix(text: &str) -> (Self, &str) {
        let text = text.trim();
        let cmp = match text.chars().next() {
            Some('<') => Comparator::Less,
            Some('>') => Comparator::Greater,
            Some('=') => Comparator::Equal,
            Some('!') => Comparator::NotEqual,
            _ => return (Comparator::Equal, text),
        };
        (cmp, text[1..].trim_start())
    }

    pub fn holds<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Comparator::Less => lhs < rhs,
            Comparator::Greater => lhs > rhs,
            Comparator::Equal => lhs == rhs,
            Comparator::NotEqual => lhs != rhs,
        }
    }
}

/// `ignore size` / `ignore file time`: a file is ignored when
/// `value(file) <cmp> limit` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub cmp: Comparator,
    pub limit: u64,
}

impl Threshold {
    pub fn ignores(&self, value: u64) -> bool {
        self.cmp.holds(value, self.limit)
    }
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (cmp, rest) = Comparator::split_prefix(s);
        let limit = rest
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not <|>|=<number>", s))?;
        Ok(Self { cmp, limit })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DupMode {
    /// CRC32C over the file content.
    Content,
    /// CRC32C over the file name.
    Name,
    /// CRC32C over the name, mixed with the size.
    NameSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DupAction {
    Delete,
    Store,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupCheck {
    pub timeout: u64,
    pub mode: DupMode,
    pub action: DupAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirSource {
    Local,
    /// Retrieved by FD into `files/incoming/<dir-id>/`.
    Remote { protocol: Protocol, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub scan_interval: u64,
    pub max_copied_files: u32,
    pub max_copied_file_size: u64,
    pub accumulate: Option<u32>,
    pub accumulate_size: Option<u64>,
    pub wait_for_filename: Option<FileMask>,
    pub ignore_size: Option<Threshold>,
    pub ignore_file_time: Option<Threshold>,
    pub end_character: Option<u8>,
    pub dup_check: Option<DupCheck>,
    pub lock_files: Vec<FileMask>,
    pub delete_unknown_files: bool,
    pub unknown_file_time: u64,
    pub delete_unreadable_files: bool,
    pub remove_on_disabled: bool,
    /// Always copy, never rename, even on the same filesystem.
    pub force_copy: bool,
    /// Paused directory is created 0770 instead of 0700.
    pub group_write: bool,
    pub info_time: Option<u64>,
    pub warn_time: Option<u64>,
    pub max_errors: u32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            scan_interval: 60,
            max_copied_files: 100,
            max_copied_file_size: 100 * 1024 * 1024,
            accumulate: None,
            accumulate_size: None,
            wait_for_filename: None,
            ignore_size: None,
            ignore_file_time: None,
            end_character: None,
            dup_check: None,
            lock_files: Vec::new(),
            delete_unknown_files: false,
            unknown_file_time: 24 * 3600,
            delete_unreadable_files: false,
            remove_on_disabled: false,
            force_copy: false,
            group_write: false,
            info_time: None,
            warn_time: None,
            max_errors: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub dir_id: u32,
    pub alias: String,
    /// Directory actually scanned.
    pub path: PathBuf,
    pub source: DirSource,
    pub host: Option<HostIdx>,
    pub file_groups: Vec<FileGroupIdx>,
    pub policy: ScanPolicy,
    pub inotify: bool,
    /// Staging root on the same filesystem as `path` when possible.
    pub fs_root: PathBuf,
    pub config_file: String,
}

impl DirEntry {
    pub fn is_remote(&self) -> bool {
        matches!(self.source, DirSource::Remote { .. })
    }

    /// `.<host-alias>/` next to the scanned directory.
    pub fn paused_dir(&self, host_alias: &str) -> PathBuf {
        let parent = self.path.parent().unwrap_or(&self.path);
        parent.join(format!(".{}", host_alias))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub name: String,
    pub dir: DirIdx,
    pub masks: Vec<FileMask>,
    pub dest_groups: Vec<DestGroupIdx>,
}

impl FileGroup {
    pub fn accepts_all(&self) -> bool {
        self.masks.len() == 1 && self.masks[0].is_match_all()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestGroup {
    pub name: String,
    pub file_group: FileGroupIdx,
    pub recipients: Vec<RecipientIdx>,
    pub options: Vec<JobOption>,
}

impl DestGroup {
    pub fn local_options(&self) -> impl Iterator<Item = &LocalOption> {
        self.options.iter().filter_map(|o| match o {
            JobOption::Local(local) => Some(local),
            JobOption::Standard(_) => None,
        })
    }

    pub fn standard_options(&self) -> impl Iterator<Item = &StandardOption> {
        self.options.iter().filter_map(|o| match o {
            JobOption::Standard(std) => Some(std),
            JobOption::Local(_) => None,
        })
    }

    pub fn time_filter(&self) -> Option<&LocalOption> {
        self.local_options()
            .find(|o| matches!(o, LocalOption::TimeFilter { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// URL without any password.
    pub url: String,
    pub protocol: Protocol,
    pub user: Option<String>,
    pub host: HostIdx,
    pub dest_group: DestGroupIdx,
    pub dir: DirIdx,
    pub job_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub alias: String,
    pub host_id: u32,
    pub hostnames: Vec<String>,
    pub toggle: u8,
    pub parallel_jobs: u32,
    pub max_errors: u32,
    pub retry_interval: u64,
    pub block_size: u32,
    pub transfer_timeout: u64,
    pub disabled: bool,
    pub recipients: Vec<RecipientIdx>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub generation: u64,
    pub dirs: Vec<DirEntry>,
    pub file_groups: Vec<FileGroup>,
    pub dest_groups: Vec<DestGroup>,
    pub recipients: Vec<Recipient>,
    pub hosts: Vec<HostEntry>,
}

impl Index<DirIdx> for RuleSet {
    type Output = DirEntry;

    fn index(&self, idx: DirIdx) -> &DirEntry {
        &self.dirs[idx.get()]
    }
}

impl Index<FileGroupIdx> for RuleSet {
    type Output = FileGroup;

    fn index(&self, idx: FileGroupIdx) -> &FileGroup {
        &self.file_groups[idx.get()]
    }
}

impl Index<DestGroupIdx> for RuleSet {
    type Output = DestGroup;

    fn index(&self, idx: DestGroupIdx) -> &DestGroup {
        &self.dest_groups[idx.get()]
    }
}

impl Index<RecipientIdx> for RuleSet {
    type Output = Recipient;

    fn index(&self, idx: RecipientIdx) -> &Recipient {
        &self.recipients[idx.get()]
    }
}

impl Index<HostIdx> for RuleSet {
    type Output = HostEntry;

    fn index(&self, idx: HostIdx) -> &HostEntry {
        &self.hosts[idx.get()]
    }
}

impl RuleSet {
    pub fn dir_indices(&self) -> impl Iterator<Item = DirIdx> {
        (0..self.dirs.len() as u32).map(DirIdx)
    }

    pub fn dir_by_id(&self, dir_id: u32) -> Option<DirIdx> {
        self.dirs
            .iter()
            .position(|d| d.dir_id == dir_id)
            .map(|i| DirIdx(i as u32))
    }

    pub fn host_by_alias(&self, alias: &str) -> Option<HostIdx> {
        self.hosts
            .iter()
            .position(|h| h.alias == alias)
            .map(|i| HostIdx(i as u32))
    }

    pub fn recipient_by_job(&self, job_id: u32) -> Option<RecipientIdx> {
        self.recipients
            .iter()
            .position(|r| r.job_id == job_id)
            .map(|i| RecipientIdx(i as u32))
    }

    /// Recipients fed by one file group, in destination group order.
    pub fn recipients_of(&self, fg: FileGroupIdx) -> Vec<RecipientIdx> {
        self[fg]
            .dest_groups
            .iter()
            .flat_map(|&dg| self[dg].recipients.iter().copied())
            .collect()
    }

    /// Every recipient reachable from a directory entry.
    pub fn recipients_of_dir(&self, dir: DirIdx) -> Vec<RecipientIdx> {
        self[dir]
            .file_groups
            .iter()
            .flat_map(|&fg| self.recipients_of(fg))
            .collect()
    }

    /// True when the directory has recipients and all their hosts are
    /// disabled according to `is_disabled`.
    pub fn all_hosts_disabled(&self, dir: DirIdx, is_disabled: impl Fn(HostIdx) -> bool) -> bool {
        let recipients = self.recipients_of_dir(dir);
        !recipients.is_empty() && recipients.iter().all(|&r| is_disabled(self[r].host))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AfdError::Fatal(format!("failed to encode rule set: {}", e)))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).with_io_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_io_context(|| format!("rename {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_io_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&data)
            .map_err(|e| AfdError::config(path.display().to_string(), e.to_string()))
    }
}

/// An option attached to a destination group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobOption {
    /// Executed by the pickup engine before handoff.
    Local(LocalOption),
    /// Passed to the transfer side in the `.options` file.
    Standard(StandardOption),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOption {
    Rename { from: FileMask, to: String },
    Exec { command: String },
    Prefix { add: bool, text: String },
    Suffix { add: bool, text: String },
    ToUpper,
    ToLower,
    /// Minutes since local midnight, `[start, end)`; wraps over midnight
    /// when `end < start`.
    TimeFilter { start: u32, end: u32 },
}

impl LocalOption {
    pub fn window_open(&self, minute_of_day: u32) -> bool {
        match *self {
            LocalOption::TimeFilter { start, end } if start <= end => {
                minute_of_day >= start && minute_of_day < end
            }
            LocalOption::TimeFilter { start, end } => minute_of_day >= start || minute_of_day < end,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandardOption {
    Archive(u64),
    Priority(u8),
    Lock(String),
    AgeLimit(u64),
}

fn parse_minutes(hhmm: &str) -> std::result::Result<u32, String> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| format!("'{}' is not hh:mm", hhmm))?;
    let h: u32 = h.parse().map_err(|_| format!("bad hour in '{}'", hhmm))?;
    let m: u32 = m.parse().map_err(|_| format!("bad minute in '{}'", hhmm))?;
    if h > 24 || m > 59 {
        return Err(format!("'{}' is out of range", hhmm));
    }
    Ok(h * 60 + m)
}

fn add_del(word: Option<&str>, option: &str) -> std::result::Result<bool, String> {
    match word {
        Some("add") => Ok(true),
        Some("del") => Ok(false),
        _ => Err(format!("{} needs add|del", option)),
    }
}

impl FromStr for JobOption {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let line = s.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut args = rest.split_whitespace();
        let number = |v: &str| v.parse::<u64>().map_err(|_| format!("'{}' needs a number", line));

        let option = match word {
            "rename" => {
                let (Some(from), Some(to)) = (args.next(), args.next()) else {
                    return Err(format!("'{}' needs <from-mask> <to>", line));
                };
                JobOption::Local(LocalOption::Rename {
                    from: from.parse()?,
                    to: to.to_string(),
                })
            }
            "exec" if !rest.is_empty() => JobOption::Local(LocalOption::Exec {
                command: rest.to_string(),
            }),
            "prefix" | "suffix" => {
                let add = add_del(args.next(), word)?;
                let text = args
                    .next()
                    .ok_or_else(|| format!("'{}' needs a text", line))?
                    .to_string();
                if word == "prefix" {
                    JobOption::Local(LocalOption::Prefix { add, text })
                } else {
                    JobOption::Local(LocalOption::Suffix { add, text })
                }
            }
            "toupper" => JobOption::Local(LocalOption::ToUpper),
            "tolower" => JobOption::Local(LocalOption::ToLower),
            "time-filter" => {
                let (start, end) = rest
                    .split_once('-')
                    .ok_or_else(|| format!("'{}' needs hh:mm-hh:mm", line))?;
                JobOption::Local(LocalOption::TimeFilter {
                    start: parse_minutes(start)?,
                    end: parse_minutes(end)?,
                })
            }
            "archive" => JobOption::Standard(StandardOption::Archive(number(rest)?)),
            "priority" => match rest.parse::<u8>() {
                Ok(p) if p <= 9 => JobOption::Standard(StandardOption::Priority(p)),
                _ => return Err(format!("'{}' needs a priority 0-9", line)),
            },
            "lock" if !rest.is_empty() => JobOption::Standard(StandardOption::Lock(rest.to_string())),
            "age-limit" => JobOption::Standard(StandardOption::AgeLimit(number(rest)?)),
            _ => return Err(format!("unknown option '{}'", line)),
        };
        Ok(option)
    }
}

impl fmt::Display for JobOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOption::Local(LocalOption::Rename { from, to }) => write!(f, "rename {} {}", from, to),
            JobOption::Local(LocalOption::Exec { command }) => write!(f, "exec {}", command),
            JobOption::Local(LocalOption::Prefix { add, text }) => {
                write!(f, "prefix {} {}", if *add { "add" } else { "del" }, text)
            }
            JobOption::Local(LocalOption::Suffix { add, text }) => {
                write!(f, "suffix {} {}", if *add { "add" } else { "del" }, text)
            }
            JobOption::Local(LocalOption::ToUpper) => f.write_str("toupper"),
            JobOption::Local(LocalOption::ToLower) => f.write_str("tolower"),
            JobOption::Local(LocalOption::TimeFilter { start, end }) => write!(
                f,
                "time-filter {:02}:{:02}-{:02}:{:02}",
                start / 60,
                start % 60,
                end / 60,
                end % 60
            ),
            JobOption::Standard(std) => write!(f, "{}", std),
        }
    }
}

impl fmt::Display for StandardOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StandardOption::Archive(secs) => write!(f, "archive {}", secs),
            StandardOption::Priority(p) => write!(f, "priority {}", p),
            StandardOption::Lock(kind) => write!(f, "lock {}", kind),
            StandardOption::AgeLimit(secs) => write!(f, "age-limit {}", secs),
        }
    }
}

impl TryFrom<String> for JobOption {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<JobOption> for String {
    fn from(option: JobOption) -> Self {
        option.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_and_comparator() {
        let t: Threshold = "> 100".parse().unwrap();
        assert!(t.ignores(101));
        assert!(!t.ignores(100));
        let t: Threshold = "0".parse().unwrap();
        assert!(t.ignores(0));
        assert_eq!(Comparator::split_prefix("!5"), (Comparator::NotEqual, "5"));
        assert!("<x".parse::<Threshold>().is_err());
    }

    #[test]
    fn test_option_parsing_round_trips_text() {
        for line in [
            "rename *.txt %t_*.dat",
            "exec gzip -9 %s",
            "prefix add X_",
            "suffix del .tmp",
            "toupper",
            "time-filter 22:00-06:30",
            "archive 3600",
            "priority 3",
            "lock DOT",
            "age-limit 600",
        ] {
            let option: JobOption = line.parse().unwrap();
            assert_eq!(option.to_string(), line);
        }
        assert!("priority 12".parse::<JobOption>().is_err());
        assert!("frobnicate".parse::<JobOption>().is_err());
        assert!("prefix up X".parse::<JobOption>().is_err());
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let JobOption::Local(filter) = "time-filter 22:00-06:00".parse::<JobOption>().unwrap() else {
            panic!("expected a local option");
        };
        assert!(filter.window_open(23 * 60));
        assert!(filter.window_open(60));
        assert!(!filter.window_open(12 * 60));
    }

    fn small_rule_set() -> RuleSet {
        let host = |alias: &str, disabled| HostEntry {
            alias: alias.to_string(),
            host_id: 0,
            hostnames: vec![],
            toggle: 1,
            parallel_jobs: 1,
            max_errors: 10,
            retry_interval: 60,
            block_size: 4096,
            transfer_timeout: 60,
            disabled,
            recipients: vec![],
        };
        let recipient = |host| Recipient {
            url: "ftp://u@h/d".to_string(),
            protocol: Protocol::Ftp,
            user: Some("u".to_string()),
            host: HostIdx(host),
            dest_group: DestGroupIdx(0),
            dir: DirIdx(0),
            job_id: 0x100 + host,
        };
        RuleSet {
            generation: 1,
            dirs: vec![DirEntry {
                dir_id: 0x1f,
                alias: "A".to_string(),
                path: PathBuf::from("/in/a"),
                source: DirSource::Local,
                host: None,
                file_groups: vec![FileGroupIdx(0)],
                policy: ScanPolicy::default(),
                inotify: false,
                fs_root: PathBuf::from("/work/files"),
                config_file: "DIR_CONFIG".to_string(),
            }],
            file_groups: vec![FileGroup {
                name: "all".to_string(),
                dir: DirIdx(0),
                masks: vec!["*".parse().unwrap()],
                dest_groups: vec![DestGroupIdx(0)],
            }],
            dest_groups: vec![DestGroup {
                name: "dg".to_string(),
                file_group: FileGroupIdx(0),
                recipients: vec![RecipientIdx(0), RecipientIdx(1)],
                options: vec!["priority 5".parse().unwrap()],
            }],
            recipients: vec![recipient(0), recipient(1)],
            hosts: vec![host("hostA", true), host("hostB", false)],
        }
    }

    #[test]
    fn test_graph_navigation() {
        let rules = small_rule_set();
        let dir = rules.dir_by_id(0x1f).unwrap();
        assert_eq!(rules.recipients_of_dir(dir).len(), 2);
        assert!(rules[FileGroupIdx(0)].accepts_all());
        assert!(!rules.all_hosts_disabled(dir, |h| rules[h].disabled));
        assert!(rules.all_hosts_disabled(dir, |_| true));
        assert_eq!(rules.recipient_by_job(0x101), Some(RecipientIdx(1)));
        assert_eq!(rules[dir].paused_dir("hostA"), PathBuf::from("/in/.hostA"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rule_set");
        let rules = small_rule_set();
        rules.save(&path).unwrap();
        assert_eq!(RuleSet::load(&path).unwrap(), rules);
    }
}
