//! What the user asked for: time window, name masks and per-section
//! predicates, and how far the search may go.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use common::logs::{DeleteRecord, InputRecord, LogKind, OutputRecord};
use common::mask::{evaluate_group, FileMask, MaskMatch};
use common::Protocol;

use crate::search::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// How a Delete record without a unique number (a file removed at pickup
/// before it ever reached staging) counts in a backward search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeleteMatchPolicy {
    /// Skipped: no lineage can be built from it.
    #[default]
    Miss,
    /// Reported on its own.
    Hit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Gt,
    Eq,
    Ne,
}

/// `<`, `>`, `=` or `!` followed by a number; no prefix means `=`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicate {
    pub op: Op,
    pub value: f64,
}

impl Predicate {
    pub fn test(&self, v: f64) -> bool {
        match self.op {
            Op::Lt => v < self.value,
            Op::Gt => v > self.value,
            Op::Eq => v == self.value,
            Op::Ne => v != self.value,
        }
    }
}

impl FromStr for Predicate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (op, rest) = match s.chars().next() {
            Some('<') => (Op::Lt, &s[1..]),
            Some('>') => (Op::Gt, &s[1..]),
            Some('=') => (Op::Eq, &s[1..]),
            Some('!') => (Op::Ne, &s[1..]),
            _ => (Op::Eq, s),
        };
        let value = rest
            .trim()
            .parse()
            .map_err(|_| anyhow!("'{}' is not a comparison like '>1024'", s))?;
        Ok(Self { op, value })
    }
}

/// Parses the letters of `-L`.
pub fn parse_log_letters(letters: &str) -> Result<BTreeSet<LogKind>> {
    let mut logs = BTreeSet::new();
    for c in letters.chars() {
        match c.to_ascii_uppercase() {
            'I' => logs.insert(LogKind::Input),
            'U' => logs.insert(LogKind::Distribution),
            'P' => logs.insert(LogKind::Production),
            'O' => logs.insert(LogKind::Output),
            'D' => logs.insert(LogKind::Delete),
            'C' | 'R' => {
                log::warn!("Log type '{}' is not kept by this AFD, ignoring it", c);
                continue;
            }
            other => bail!("Unknown log type '{}' in -L (use I, U, P, C, R, O, D)", other),
        };
    }
    Ok(logs)
}

/// Parses `-p` into a protocol bit union.
pub fn parse_protocols(list: &str) -> Result<u32> {
    let mut mask = 0;
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let protocol = Protocol::ALL
            .iter()
            .find(|p| p.scheme().eq_ignore_ascii_case(name) || format!("{:?}", p).eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("Unknown protocol '{}'", name))?;
        mask |= protocol.bit();
    }
    Ok(mask)
}

#[derive(Debug, Clone)]
pub struct Query {
    pub direction: Direction,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub masks: Vec<FileMask>,
    /// `None` accepts every directory.
    pub dir_ids: Option<HashSet<u32>>,
    pub hosts: Vec<FileMask>,
    /// Bit union of `Protocol::bit`; 0 accepts all.
    pub protocols: u32,
    pub job_id: Option<u32>,
    pub unique: Option<u32>,
    pub original_size: Option<Predicate>,
    pub sizes: Vec<(LogKind, Predicate)>,
    pub durations: Vec<(LogKind, Predicate)>,
    pub logs: BTreeSet<LogKind>,
    /// Furthest a stage may lie behind the previous one, in log time.
    pub max_diff_time: Option<i64>,
    /// Wall clock allowed for one search.
    pub max_search_time: Option<Duration>,
    pub unique_less_deletes: DeleteMatchPolicy,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            direction: Direction::Forward,
            start: None,
            end: None,
            masks: Vec::new(),
            dir_ids: None,
            hosts: Vec::new(),
            protocols: 0,
            job_id: None,
            unique: None,
            original_size: None,
            sizes: Vec::new(),
            durations: Vec::new(),
            logs: LogKind::LINEAGE.into_iter().collect(),
            max_diff_time: None,
            max_search_time: None,
            unique_less_deletes: DeleteMatchPolicy::Miss,
        }
    }
}

impl Query {
    pub fn uses(&self, kind: LogKind) -> bool {
        self.logs.contains(&kind)
    }

    pub fn in_window(&self, time: i64) -> bool {
        self.start.map_or(true, |s| time >= s) && self.end.map_or(true, |e| time <= e)
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.masks.is_empty() || evaluate_group(&self.masks, name) == MaskMatch::Accept
    }

    fn dir_matches(&self, dir_id: u32) -> bool {
        self.dir_ids.as_ref().map_or(true, |ids| ids.contains(&dir_id))
    }

    fn host_matches(&self, alias: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|m| m.matches(alias))
    }

    fn size_ok(&self, kind: LogKind, size: Option<u64>) -> bool {
        self.sizes
            .iter()
            .filter(|(k, _)| *k == kind)
            .all(|(_, p)| size.map_or(false, |s| p.test(s as f64)))
    }

    fn duration_ok(&self, kind: LogKind, secs: Option<f64>) -> bool {
        self.durations
            .iter()
            .filter(|(k, _)| *k == kind)
            .all(|(_, p)| secs.map_or(false, |s| p.test(s)))
    }

    /// Cheap test applied to Input records before they are followed.
    pub fn input_candidate(&self, rec: &InputRecord) -> bool {
        self.in_window(rec.time)
            && self.name_matches(&rec.filename)
            && self.dir_matches(rec.dir_id)
            && self.unique.map_or(true, |u| u == rec.unique_number)
            && self.size_ok(LogKind::Input, Some(rec.size))
    }

    /// Cheap test applied to Output records before they are traced back.
    pub fn output_candidate(&self, rec: &OutputRecord) -> bool {
        self.in_window(rec.time)
            && (self.name_matches(&rec.local_name) || self.name_matches(&rec.remote_name))
            && self.host_matches(&rec.host_alias)
            && (self.protocols == 0 || self.protocols & rec.protocol != 0)
            && self.job_id.map_or(true, |j| j == rec.job_id)
            && self.unique.map_or(true, |u| u == rec.key.unique_number)
    }

    /// Cheap test applied to Delete records before they are traced back.
    pub fn delete_candidate(&self, rec: &DeleteRecord) -> bool {
        self.in_window(rec.time)
            && self.name_matches(&rec.filename)
            && self.host_matches(rec.host_alias.as_deref().unwrap_or("-"))
            && self.job_id.map_or(true, |j| j == rec.job_id)
            && self.unique.map_or(true, |u| rec.key().map_or(false, |k| k.unique_number == u))
    }

    /// Full check of a finished trace. A filter on a section the trace
    /// does not have fails.
    pub fn accepts(&self, trace: &Trace) -> bool {
        if let Some(ids) = &self.dir_ids {
            if !trace.dir_id().map_or(false, |id| ids.contains(&id)) {
                return false;
            }
        }
        if !self.hosts.is_empty() && !trace.host_alias().map_or(false, |h| self.host_matches(h)) {
            return false;
        }
        if self.protocols != 0 && !trace.output.as_ref().map_or(false, |o| self.protocols & o.protocol != 0) {
            return false;
        }
        if let Some(job) = self.job_id {
            if trace.job_id() != Some(job) {
                return false;
            }
        }
        if let Some(unique) = self.unique {
            if trace.unique_number() != Some(unique) {
                return false;
            }
        }
        if let Some(p) = &self.original_size {
            let original = trace
                .production
                .first()
                .and_then(|r| r.original_size)
                .or_else(|| trace.input.as_ref().map(|i| i.size));
            if !original.map_or(false, |s| p.test(s as f64)) {
                return false;
            }
        }
        self.size_ok(LogKind::Input, trace.input.as_ref().map(|r| r.size))
            && self.size_ok(LogKind::Distribution, trace.distribution.as_ref().map(|r| r.size))
            && self.size_ok(LogKind::Production, trace.production.last().map(|r| r.new_size))
            && self.size_ok(LogKind::Output, trace.output.as_ref().map(|r| r.size))
            && self.size_ok(LogKind::Delete, trace.delete.as_ref().map(|r| r.size))
            && self.duration_ok(
                LogKind::Production,
                trace.production.last().and_then(|r| r.timing).map(|t| t.duration as f64),
            )
            && self.duration_ok(LogKind::Output, trace.output.as_ref().map(|r| r.transmission_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::JobKey;

    #[test]
    fn test_predicates() {
        let p: Predicate = ">1024".parse().unwrap();
        assert!(p.test(2048.0) && !p.test(1024.0));
        let p: Predicate = "!0".parse().unwrap();
        assert!(p.test(1.0) && !p.test(0.0));
        let p: Predicate = "42".parse().unwrap();
        assert_eq!(p.op, Op::Eq);
        assert!("<big".parse::<Predicate>().is_err());
    }

    #[test]
    fn test_log_letters_and_protocols() {
        let logs = parse_log_letters("iOd").unwrap();
        assert_eq!(logs.into_iter().collect::<Vec<_>>(), vec![LogKind::Input, LogKind::Output, LogKind::Delete]);
        assert!(parse_log_letters("IX").is_err());
        assert_eq!(parse_protocols("sftp,file").unwrap(), Protocol::Sftp.bit() | Protocol::Loc.bit());
        assert!(parse_protocols("gopher").is_err());
    }

    #[test]
    fn test_trace_filters() {
        let mut query = Query {
            hosts: vec!["edge*".parse().unwrap()],
            sizes: vec![(LogKind::Input, ">3".parse().unwrap())],
            ..Query::default()
        };
        let mut trace = Trace {
            input: Some(InputRecord {
                time: 0x10,
                filename: "a.txt".into(),
                size: 5,
                dir_id: 0x1f,
                unique_number: 1,
            }),
            ..Trace::default()
        };
        // The host filter needs an Output or Delete section.
        assert!(!query.accepts(&trace));
        trace.delete = Some(DeleteRecord {
            time: 0x20,
            host_alias: Some("edge1".into()),
            reason: 0x11,
            filename: "a.txt".into(),
            size: 5,
            job_id: 7,
            origin: Some((0x1f, JobKey::new(0x10, 1, 0))),
            user: "fd".into(),
            additional: None,
        });
        assert!(query.accepts(&trace));
        query.dir_ids = Some([0x2f].into_iter().collect());
        assert!(!query.accepts(&trace));
    }
}
