//! Continuous mode (`-c`, `-C`): tail the logs and report traces as the
//! records they need arrive.
//!
//! Forward, a new Input record waits until every recipient of the file
//! reached Output or Delete, or until it is older than `max_diff_time`;
//! then its traces are reported (marked cut when incomplete). Backward, a
//! new Output or Delete record is resolved at once.

use std::path::PathBuf;

use anyhow::Result;
use common::logs::{log_path, DeleteRecord, InputRecord, LogFollower, LogKind, OutputRecord};

use crate::query::Direction;
use crate::search::{Searcher, Terminal, Trace};

/// How long a forward trace may stay incomplete when `-g` is not given.
pub const DEFAULT_MAX_AGE: i64 = 3600;

/// One tailed log. Opened once `<BASE>.0` exists: at its end when it was
/// there at startup, from the start when it showed up later.
struct Tail {
    kind: LogKind,
    dir: PathBuf,
    follower: Option<LogFollower>,
    at_start: bool,
}

impl Tail {
    fn new(dir: PathBuf, kind: LogKind) -> Result<Self> {
        let mut tail = Self {
            kind,
            dir,
            follower: None,
            at_start: true,
        };
        tail.open_if_present()?;
        tail.at_start = false;
        Ok(tail)
    }

    fn open_if_present(&mut self) -> Result<()> {
        if self.follower.is_none() && log_path(&self.dir, self.kind, 0).exists() {
            let from = if self.at_start { None } else { Some(0) };
            self.follower = Some(LogFollower::open(&self.dir, self.kind, from)?);
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<String>> {
        self.open_if_present()?;
        match &mut self.follower {
            Some(follower) => Ok(follower.poll_lines()?),
            None => Ok(Vec::new()),
        }
    }
}

pub struct Follower<'q> {
    searcher: Searcher<'q>,
    tails: Vec<Tail>,
    pending: Vec<InputRecord>,
    max_age: i64,
}

impl<'q> Follower<'q> {
    pub fn new(searcher: Searcher<'q>) -> Result<Self> {
        let query = searcher.query();
        let dir = searcher.store().dir.clone();
        let kinds: Vec<LogKind> = match query.direction {
            Direction::Forward => vec![LogKind::Input],
            Direction::Backward => [LogKind::Output, LogKind::Delete]
                .into_iter()
                .filter(|k| query.uses(*k))
                .collect(),
        };
        let tails = kinds
            .into_iter()
            .map(|k| Tail::new(dir.clone(), k))
            .collect::<Result<Vec<_>>>()?;
        let max_age = query.max_diff_time.unwrap_or(DEFAULT_MAX_AGE);
        Ok(Self {
            searcher,
            tails,
            pending: Vec::new(),
            max_age,
        })
    }

    pub fn searcher(&self) -> &Searcher<'q> {
        &self.searcher
    }

    /// Inputs still waiting for their later stages.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Reads what arrived since the last call; `now` is compared with
    /// record times to age out pending inputs.
    pub fn poll(&mut self, now: i64) -> Result<Vec<Trace>> {
        self.searcher.reset_budget();
        let mut traces = match self.searcher.query().direction {
            Direction::Forward => self.poll_forward(now)?,
            Direction::Backward => self.poll_backward()?,
        };
        traces.sort_by_key(Trace::last_time);
        Ok(traces)
    }

    fn poll_forward(&mut self, now: i64) -> Result<Vec<Trace>> {
        let query = self.searcher.query();
        let sep = self.searcher.store().sep;
        for tail in &mut self.tails {
            for line in tail.poll()? {
                match InputRecord::parse(&line, sep) {
                    Ok(r) if query.input_candidate(&r) => self.pending.push(r),
                    Ok(_) => {}
                    Err(e) => log::debug!("Skipping input record: {}", e),
                }
            }
        }

        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for input in std::mem::take(&mut self.pending) {
            let mut leaves = self.searcher.follow_input(&input)?;
            let aged = now.saturating_sub(input.time) > self.max_age;
            if leaves.iter().all(Trace::is_complete) || aged {
                for leaf in &mut leaves {
                    leaf.cut |= !leaf.is_complete();
                }
                ready.extend(leaves.into_iter().filter(|t| query.accepts(t)));
            } else {
                waiting.push(input);
            }
        }
        self.pending = waiting;
        for trace in &ready {
            self.searcher.note(trace);
        }
        Ok(ready)
    }

    fn poll_backward(&mut self) -> Result<Vec<Trace>> {
        let query = self.searcher.query();
        let sep = self.searcher.store().sep;
        let mut terminals = Vec::new();
        for tail in &mut self.tails {
            let kind = tail.kind;
            for line in tail.poll()? {
                let terminal = match kind {
                    LogKind::Output => OutputRecord::parse(&line, sep)
                        .map(|r| query.output_candidate(&r).then_some(Terminal::Output(r))),
                    _ => DeleteRecord::parse(&line, sep)
                        .map(|r| query.delete_candidate(&r).then_some(Terminal::Delete(r))),
                };
                match terminal {
                    Ok(Some(t)) => terminals.push(t),
                    Ok(None) => {}
                    Err(e) => log::debug!("Skipping {} record: {}", kind.label(), e),
                }
            }
        }
        terminals.sort_by_key(Terminal::time);

        let mut ready = Vec::new();
        for terminal in terminals {
            if let Some(trace) = self.searcher.resolve_back(terminal)? {
                if query.accepts(&trace) {
                    self.searcher.note(&trace);
                    ready.push(trace);
                }
            }
        }
        Ok(ready)
    }
}
