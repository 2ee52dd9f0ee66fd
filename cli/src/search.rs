//! Forward and backward lineage search over the logs of one AFD.
//!
//! Forward: Input, then the Distribution records of the same batch
//! (`dir_id`, `unique_number`, input time), then per job the Production
//! chain and finally Output or Delete. Backward walks the same joins the
//! other way from an Output or Delete record.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use common::logs::{
    DeleteRecord, DistributionRecord, InputRecord, LogKind, LogSegment, OutputRecord, ProductionRecord,
    DEFAULT_SEPARATOR,
};
use common::{JobKey, WorkPaths};

use crate::cache::{Flow, PositionCache, ORDER_SLACK};
use crate::hostlist::HostList;
use crate::query::{DeleteMatchPolicy, Direction, Query};

/// Longest rename/exec chain followed for one file.
const MAX_CHAIN: usize = 32;

/// How far past an Output record a remote AFD's Input is looked for when
/// no `-g` limit is set.
const REMOTE_WINDOW: i64 = 3600;

/// Most AFDs one file is followed through.
const MAX_HOPS: usize = 8;

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    separator: Option<String>,
}

/// Reads the log separator from `etc/AFD_CONFIG.*`; `|` when unset.
fn read_separator(etc: &Path) -> Result<u8> {
    for name in ["AFD_CONFIG.toml", "AFD_CONFIG.yaml", "AFD_CONFIG.yml"] {
        let path = etc.join(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let config: ConfigFile = if name.ends_with(".toml") {
            toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?
        };
        return match config.logging.separator.as_deref().map(str::as_bytes) {
            None => Ok(DEFAULT_SEPARATOR),
            Some([b]) if b.is_ascii_punctuation() => Ok(*b),
            Some(_) => bail!("{}: separator must be one punctuation character", path.display()),
        };
    }
    Ok(DEFAULT_SEPARATOR)
}

/// The log directory of one AFD.
#[derive(Debug, Clone)]
pub struct LogStore {
    pub afd: String,
    pub dir: PathBuf,
    pub sep: u8,
}

impl LogStore {
    pub fn open(afd: &str, paths: &WorkPaths) -> Result<Self> {
        Ok(Self {
            afd: afd.to_string(),
            dir: paths.log_dir(),
            sep: read_separator(&paths.etc_dir())?,
        })
    }

    pub fn segments(&self, kind: LogKind) -> Result<Vec<LogSegment>> {
        LogSegment::list(&self.dir, kind)
            .with_context(|| format!("Failed to list {} logs in {}", kind.label(), self.dir.display()))
    }
}

/// The history of one file on its way to one recipient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// Alias of the AFD whose logs produced this trace.
    pub afd: String,
    pub input: Option<InputRecord>,
    pub distribution: Option<DistributionRecord>,
    pub production: Vec<ProductionRecord>,
    pub output: Option<OutputRecord>,
    pub delete: Option<DeleteRecord>,
    /// A later stage was not found within `max_diff_time`.
    pub cut: bool,
}

impl Trace {
    pub fn dir_id(&self) -> Option<u32> {
        self.input
            .as_ref()
            .map(|r| r.dir_id)
            .or_else(|| self.distribution.as_ref().map(|r| r.dir_id))
            .or_else(|| self.delete.as_ref().and_then(|r| r.dir_id()))
    }

    pub fn host_alias(&self) -> Option<&str> {
        self.output
            .as_ref()
            .map(|r| r.host_alias.as_str())
            .or_else(|| self.delete.as_ref().map(|r| r.host_alias.as_deref().unwrap_or("-")))
    }

    pub fn job_id(&self) -> Option<u32> {
        self.output
            .as_ref()
            .map(|r| r.job_id)
            .or_else(|| self.delete.as_ref().map(|r| r.job_id))
            .or_else(|| self.production.last().map(|r| r.job_id))
    }

    pub fn unique_number(&self) -> Option<u32> {
        self.input
            .as_ref()
            .map(|r| r.unique_number)
            .or_else(|| self.distribution.as_ref().map(|r| r.unique_number))
            .or_else(|| self.output.as_ref().map(|r| r.key.unique_number))
            .or_else(|| self.delete.as_ref().and_then(|r| r.key()).map(|k| k.unique_number))
    }

    /// Reached Output or Delete.
    pub fn is_complete(&self) -> bool {
        self.output.is_some() || self.delete.is_some()
    }

    /// Time of the latest record, used to order results.
    pub fn last_time(&self) -> i64 {
        [
            self.input.as_ref().map(|r| r.time),
            self.distribution.as_ref().map(|r| r.time),
            self.production.last().map(|r| r.time),
            self.output.as_ref().map(|r| r.time),
            self.delete.as_ref().map(|r| r.time),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }
}

/// Overall wall clock allowance of a search.
#[derive(Debug)]
pub struct Budget {
    deadline: Option<Instant>,
}

impl Budget {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            deadline: limit.map(|l| Instant::now() + l),
        }
    }

    pub fn left(&self) -> bool {
        self.deadline.map_or(true, |d| Instant::now() < d)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStats {
    pub traces: usize,
    /// Traces that stopped at the per-file limit.
    pub cut: usize,
    /// The overall limit ran out before the search finished.
    pub exhausted: bool,
}

impl SearchStats {
    pub fn partial(&self) -> bool {
        self.exhausted || self.cut > 0
    }
}

/// Records downstream of one batch.
#[derive(Debug, Default, Clone)]
struct Downstream {
    distributions: Vec<DistributionRecord>,
    productions: Vec<ProductionRecord>,
    outputs: Vec<OutputRecord>,
    deletes: Vec<DeleteRecord>,
}

/// What a backward search starts from.
#[derive(Debug, Clone)]
pub enum Terminal {
    Output(OutputRecord),
    Delete(DeleteRecord),
}

impl Terminal {
    pub fn time(&self) -> i64 {
        match self {
            Terminal::Output(r) => r.time,
            Terminal::Delete(r) => r.time,
        }
    }
}

pub struct Searcher<'q> {
    store: LogStore,
    query: &'q Query,
    cache: PositionCache,
    budget: Budget,
    pub stats: SearchStats,
}

impl<'q> Searcher<'q> {
    pub fn new(store: LogStore, query: &'q Query) -> Self {
        Self {
            budget: Budget::new(query.max_search_time),
            store,
            query,
            cache: PositionCache::new(),
            stats: SearchStats::default(),
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn query(&self) -> &'q Query {
        self.query
    }

    /// Starts a fresh overall time allowance (each continuous poll).
    pub fn reset_budget(&mut self) {
        self.budget = Budget::new(self.query.max_search_time);
    }

    fn horizon(&self, from: i64) -> Option<i64> {
        self.query.max_diff_time.map(|d| from.saturating_add(d))
    }

    /// Visits parsed records of `kind` in `[from, to]`, oldest file first.
    fn scan_records<R>(
        &mut self,
        kind: LogKind,
        from: Option<i64>,
        to: Option<i64>,
        parse: fn(&str, u8) -> common::Result<R>,
        mut visit: impl FnMut(u64, u64, R) -> Flow,
    ) -> Result<()> {
        if self.stats.exhausted {
            return Ok(());
        }
        let sep = self.store.sep;
        let segments = self.store.segments(kind)?;
        let budget = &self.budget;
        let cache = &mut self.cache;
        for segment in segments {
            if !segment.overlaps(
                from.map(|f| f.saturating_sub(ORDER_SLACK)),
                to.map(|t| t.saturating_add(ORDER_SLACK)),
            ) {
                continue;
            }
            let inode = segment.inode;
            let mut stopped = false;
            let finished = cache.scan(
                &segment,
                from,
                to,
                || budget.left(),
                |line| {
                    match parse(&line.text, sep) {
                        Ok(record) => {
                            if visit(inode, line.offset, record) == Flow::Stop {
                                stopped = true;
                                return Ok(Flow::Stop);
                            }
                        }
                        Err(e) => log::debug!("Skipping {} record at {}: {}", kind.label(), line.offset, e),
                    }
                    Ok(Flow::Continue)
                },
            )?;
            if !finished {
                log::warn!("Search time exhausted while reading {}", segment.path.display());
                self.stats.exhausted = true;
                break;
            }
            if stopped {
                break;
            }
        }
        Ok(())
    }

    /// Everything downstream of the batch `(dir_id, time, unique)` up to
    /// the `max_diff_time` horizon.
    fn downstream(&mut self, dir_id: u32, time: i64, unique: u32) -> Result<Downstream> {
        let key = JobKey::new(time, unique, 0);
        let to = self.horizon(time);
        let within = move |t: i64| to.map_or(true, |to| t <= to);
        let mut ds = Downstream::default();
        if self.query.uses(LogKind::Distribution) {
            self.scan_records(LogKind::Distribution, Some(time), to, DistributionRecord::parse, |_, _, r| {
                if r.dir_id == dir_id && r.input_time == time && r.unique_number == unique && within(r.time) {
                    ds.distributions.push(r);
                }
                Flow::Continue
            })?;
        }
        if self.query.uses(LogKind::Production) {
            self.scan_records(LogKind::Production, Some(time), to, ProductionRecord::parse, |_, _, r| {
                if r.key.same_batch(&key) && within(r.time) {
                    ds.productions.push(r);
                }
                Flow::Continue
            })?;
        }
        if self.query.uses(LogKind::Output) {
            self.scan_records(LogKind::Output, Some(time), to, OutputRecord::parse, |_, _, r| {
                if r.key.same_batch(&key) && within(r.time) {
                    ds.outputs.push(r);
                }
                Flow::Continue
            })?;
        }
        if self.query.uses(LogKind::Delete) {
            self.scan_records(LogKind::Delete, Some(time), to, DeleteRecord::parse, |_, _, r| {
                if r.key().map_or(false, |k| k.same_batch(&key)) && r.dir_id() == Some(dir_id) && within(r.time) {
                    ds.deletes.push(r);
                }
                Flow::Continue
            })?;
        }
        Ok(ds)
    }

    /// Every leaf trace of one Input record.
    pub fn follow_input(&mut self, input: &InputRecord) -> Result<Vec<Trace>> {
        let ds = self.downstream(input.dir_id, input.time, input.unique_number)?;
        let base = Trace {
            afd: self.store.afd.clone(),
            input: Some(input.clone()),
            ..Trace::default()
        };

        // (distribution record, job id) pairs this file went to.
        let mut jobs: Vec<(Option<&DistributionRecord>, u32)> = Vec::new();
        if self.query.uses(LogKind::Distribution) {
            for d in ds.distributions.iter().filter(|d| d.filename == input.filename) {
                for &(job_id, _) in &d.jobs {
                    if !jobs.iter().any(|(_, j)| *j == job_id) {
                        jobs.push((Some(d), job_id));
                    }
                }
            }
        } else {
            let seen: HashSet<u32> = ds
                .productions
                .iter()
                .map(|r| r.job_id)
                .chain(ds.outputs.iter().map(|r| r.job_id))
                .chain(ds.deletes.iter().map(|r| r.job_id))
                .collect();
            jobs.extend(seen.into_iter().map(|j| (None, j)));
            jobs.sort_by_key(|(_, j)| *j);
        }

        let limited = self.query.max_diff_time.is_some();
        if jobs.is_empty() {
            let cut = limited && self.query.uses(LogKind::Distribution);
            return Ok(vec![Trace { cut, ..base }]);
        }

        let mut leaves = Vec::new();
        for (distribution, job_id) in jobs {
            for (name, chain) in chain_forward(&ds.productions, job_id, &input.filename) {
                let with_stages = Trace {
                    distribution: distribution.cloned(),
                    production: chain,
                    ..base.clone()
                };
                let outputs: Vec<&OutputRecord> =
                    ds.outputs.iter().filter(|o| o.job_id == job_id && o.local_name == name).collect();
                let deletes: Vec<&DeleteRecord> =
                    ds.deletes.iter().filter(|d| d.job_id == job_id && d.filename == name).collect();
                if outputs.is_empty() && deletes.is_empty() {
                    let cut = limited && (self.query.uses(LogKind::Output) || self.query.uses(LogKind::Delete));
                    leaves.push(Trace { cut, ..with_stages });
                    continue;
                }
                for o in outputs {
                    leaves.push(Trace {
                        output: Some(o.clone()),
                        ..with_stages.clone()
                    });
                }
                for d in deletes {
                    leaves.push(Trace {
                        delete: Some(d.clone()),
                        ..with_stages.clone()
                    });
                }
            }
        }
        Ok(leaves)
    }

    /// Forward search from the Input records matching the query.
    pub fn forward(&mut self) -> Result<Vec<Trace>> {
        let query = self.query;
        let mut inputs = Vec::new();
        self.scan_records(LogKind::Input, query.start, query.end, InputRecord::parse, |inode, offset, r| {
            if query.input_candidate(&r) {
                inputs.push((inode, offset, r));
            }
            Flow::Continue
        })?;

        let mut traces = Vec::new();
        for (inode, offset, input) in inputs {
            if self.stats.exhausted {
                break;
            }
            let mut reported = false;
            for trace in self.follow_input(&input)? {
                if query.accepts(&trace) {
                    self.note(&trace);
                    traces.push(trace);
                    reported = true;
                }
            }
            if reported {
                self.cache.mark_gotcha(inode, offset);
            }
        }
        Ok(traces)
    }

    pub(crate) fn note(&mut self, trace: &Trace) {
        self.stats.traces += 1;
        if trace.cut {
            self.stats.cut += 1;
        }
    }

    /// Builds the trace leading up to an Output or Delete record. `None`
    /// when the record cannot start a trace under the query's policy.
    pub fn resolve_back(&mut self, terminal: Terminal) -> Result<Option<Trace>> {
        let (key, job_id, name, t) = match &terminal {
            Terminal::Output(r) => (r.key, r.job_id, r.local_name.clone(), r.time),
            Terminal::Delete(r) => match r.key().filter(JobKey::has_unique) {
                Some(key) => (key, r.job_id, r.filename.clone(), r.time),
                None => {
                    return Ok(match self.query.unique_less_deletes {
                        DeleteMatchPolicy::Miss => None,
                        DeleteMatchPolicy::Hit => Some(Trace {
                            afd: self.store.afd.clone(),
                            delete: Some(r.clone()),
                            ..Trace::default()
                        }),
                    });
                }
            },
        };
        let from = key.creation_time;
        let mut trace = Trace {
            afd: self.store.afd.clone(),
            ..Trace::default()
        };
        match terminal {
            Terminal::Output(r) => trace.output = Some(r),
            Terminal::Delete(r) => trace.delete = Some(r),
        }

        let mut original = name;
        if self.query.uses(LogKind::Production) {
            let mut productions = Vec::new();
            self.scan_records(LogKind::Production, Some(from), Some(t), ProductionRecord::parse, |_, _, r| {
                if r.key.same_batch(&key) && r.job_id == job_id {
                    productions.push(r);
                }
                Flow::Continue
            })?;
            let (first, chain) = chain_backward(productions, &original);
            original = first;
            trace.production = chain;
        }

        let mut dir_id = trace.delete.as_ref().and_then(|d| d.dir_id());
        if self.query.uses(LogKind::Distribution) {
            let mut found = None;
            self.scan_records(LogKind::Distribution, Some(from), Some(t), DistributionRecord::parse, |_, _, r| {
                if r.input_time == from
                    && r.unique_number == key.unique_number
                    && r.filename == original
                    && r.jobs.iter().any(|(j, _)| *j == job_id)
                {
                    found = Some(r);
                    return Flow::Stop;
                }
                Flow::Continue
            })?;
            if let Some(d) = &found {
                dir_id = Some(d.dir_id);
            }
            trace.distribution = found;
        }

        if self.query.uses(LogKind::Input) {
            let mut found = None;
            self.scan_records(LogKind::Input, Some(from), Some(from), InputRecord::parse, |_, _, r| {
                if r.time == from
                    && r.unique_number == key.unique_number
                    && r.filename == original
                    && dir_id.map_or(true, |d| d == r.dir_id)
                {
                    found = Some(r);
                    return Flow::Stop;
                }
                Flow::Continue
            })?;
            trace.input = found;
        }
        Ok(Some(trace))
    }

    /// Output and Delete records in the window that match the query.
    fn terminals(&mut self) -> Result<Vec<(u64, u64, Terminal)>> {
        let query = self.query;
        if !query.uses(LogKind::Output) && !query.uses(LogKind::Delete) {
            bail!("A backward search needs the O or D log (see -L)");
        }
        let mut found = Vec::new();
        if query.uses(LogKind::Output) {
            self.scan_records(LogKind::Output, query.start, query.end, OutputRecord::parse, |inode, offset, r| {
                if query.output_candidate(&r) {
                    found.push((inode, offset, Terminal::Output(r)));
                }
                Flow::Continue
            })?;
        }
        if query.uses(LogKind::Delete) {
            self.scan_records(LogKind::Delete, query.start, query.end, DeleteRecord::parse, |inode, offset, r| {
                if query.delete_candidate(&r) {
                    found.push((inode, offset, Terminal::Delete(r)));
                }
                Flow::Continue
            })?;
        }
        found.sort_by_key(|(_, _, t)| t.time());
        Ok(found)
    }

    /// Backward search from the Output and Delete records matching the query.
    pub fn backward(&mut self) -> Result<Vec<Trace>> {
        let query = self.query;
        let mut traces = Vec::new();
        for (inode, offset, terminal) in self.terminals()? {
            if self.stats.exhausted {
                break;
            }
            if let Some(trace) = self.resolve_back(terminal)? {
                if query.accepts(&trace) {
                    self.note(&trace);
                    traces.push(trace);
                    self.cache.mark_gotcha(inode, offset);
                }
            }
        }
        Ok(traces)
    }

    pub fn run(&mut self) -> Result<Vec<Trace>> {
        match self.query.direction {
            Direction::Forward => self.forward(),
            Direction::Backward => self.backward(),
        }
    }

    /// Forward traces of the first Input named `name` in `[from, to]`,
    /// without applying the query's filters. Used when a file crossed
    /// over from another AFD.
    pub fn follow_named_input(&mut self, name: &str, from: i64, to: i64) -> Result<Vec<Trace>> {
        let mut found = None;
        self.scan_records(LogKind::Input, Some(from), Some(to), InputRecord::parse, |_, _, r| {
            if r.filename == name && r.time >= from && r.time <= to {
                found = Some(r);
                return Flow::Stop;
            }
            Flow::Continue
        })?;
        match found {
            Some(input) => self.follow_input(&input),
            None => Ok(Vec::new()),
        }
    }
}

/// Follows rename/exec steps of job `job_id` from `name`. Each result is a
/// final name with the production records that led to it.
fn chain_forward(productions: &[ProductionRecord], job_id: u32, name: &str) -> Vec<(String, Vec<ProductionRecord>)> {
    let mut done = Vec::new();
    let mut frontier = vec![(name.to_string(), Vec::<ProductionRecord>::new())];
    while let Some((name, chain)) = frontier.pop() {
        let next: Vec<&ProductionRecord> = productions
            .iter()
            .filter(|p| p.job_id == job_id && p.original_name == name && !chain.contains(p))
            .collect();
        if next.is_empty() || chain.len() >= MAX_CHAIN {
            done.push((name, chain));
            continue;
        }
        for p in next {
            let mut longer = chain.clone();
            longer.push(p.clone());
            frontier.push((p.new_name.clone(), longer));
        }
    }
    done.reverse();
    done
}

/// Walks production records back from `name`; returns the original name
/// and the steps in the order they happened.
fn chain_backward(mut productions: Vec<ProductionRecord>, name: &str) -> (String, Vec<ProductionRecord>) {
    let mut current = name.to_string();
    let mut chain = Vec::new();
    while chain.len() < MAX_CHAIN {
        let Some(pos) = productions.iter().rposition(|p| p.new_name == current) else {
            break;
        };
        let step = productions.remove(pos);
        current = step.original_name.clone();
        chain.push(step);
    }
    chain.reverse();
    (current, chain)
}

/// Whether `spec` (`%alias`, `#hex-id` or a name) names the AFD `alias`.
fn names_afd(spec: &str, alias: &str, hosts: &HostList) -> bool {
    match hosts.find(spec) {
        Some(host) => host.alias == alias,
        None => spec.strip_prefix('%').unwrap_or(spec) == alias,
    }
}

/// Continues forward traces whose Output went to another AFD listed in
/// `hosts`, hop by hop, and not past the AFD named by `stop_at`. An AFD
/// already on a file's path is not entered again.
pub fn follow_remote(
    traces: &[Trace],
    hosts: &HostList,
    query: &Query,
    stop_at: Option<&str>,
) -> Result<Vec<Trace>> {
    let mut extra = Vec::new();
    let mut stores: HashMap<String, LogStore> = HashMap::new();
    let mut frontier: Vec<(Trace, Vec<String>)> = traces.iter().map(|t| (t.clone(), vec![t.afd.clone()])).collect();

    while let Some((trace, path)) = frontier.pop() {
        if stop_at.map_or(false, |s| names_afd(s, &trace.afd, hosts)) || path.len() > MAX_HOPS {
            continue;
        }
        let Some(output) = &trace.output else { continue };
        let Some(peer) = hosts.by_alias(&output.host_alias) else { continue };
        if path.contains(&peer.alias) {
            log::debug!("{} loops back to {}", output.local_name, peer.alias);
            continue;
        }
        let store = match stores.get(&peer.alias) {
            Some(store) => store.clone(),
            None => {
                let store = LogStore::open(&peer.alias, &WorkPaths::new(&peer.work_dir))?;
                stores.insert(peer.alias.clone(), store.clone());
                store
            }
        };
        let name = if output.remote_name.is_empty() {
            &output.local_name
        } else {
            &output.remote_name
        };
        let window = query.max_diff_time.unwrap_or(REMOTE_WINDOW);
        let hops = Searcher::new(store, query).follow_named_input(
            name,
            output.time.saturating_sub(ORDER_SLACK),
            output.time.saturating_add(window),
        )?;
        if hops.is_empty() {
            log::info!("{}: no Input record for {} in {}", peer.alias, name, peer.work_dir.display());
        }
        for hop in hops {
            let mut longer = path.clone();
            longer.push(peer.alias.clone());
            frontier.push((hop.clone(), longer));
            extra.push(hop);
        }
    }
    Ok(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::logs::{DeleteReason, DistributionType, LogPolicy, LogSet, ProductionTiming};

    const T: i64 = 0x6000_0000;

    struct Afd {
        _dir: tempfile::TempDir,
        paths: WorkPaths,
        logs: LogSet,
    }

    fn afd() -> Afd {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkPaths::new(dir.path());
        paths.create_all().unwrap();
        let logs = LogSet::open(&paths.log_dir(), &LogKind::LINEAGE, b'|', |_| LogPolicy::default()).unwrap();
        Afd { _dir: dir, paths, logs }
    }

    fn input(name: &str, unique: u32) -> InputRecord {
        InputRecord {
            time: T,
            filename: name.into(),
            size: 5,
            dir_id: 0x1f,
            unique_number: unique,
        }
    }

    fn distribution(name: &str, unique: u32, jobs: Vec<(u32, u32)>) -> DistributionRecord {
        DistributionRecord {
            time: T,
            dis_type: DistributionType::Normal,
            filename: name.into(),
            input_time: T,
            dir_id: 0x1f,
            unique_number: unique,
            size: 5,
            jobs,
        }
    }

    fn output(name: &str, job_id: u32, key: JobKey, host: &str) -> OutputRecord {
        OutputRecord {
            time: T + 30,
            host_alias: host.into(),
            output_type: Some(0),
            toggle: Some(1),
            protocol: 0x8,
            local_name: name.into(),
            remote_name: name.into(),
            size: 5,
            transmission_time: 0.25,
            retries: None,
            job_id,
            key,
            mail_id: None,
            archive_dir: None,
        }
    }

    fn rename(from: &str, to: &str, job_id: u32, key: JobKey) -> ProductionRecord {
        ProductionRecord {
            time: T + 1,
            ratio: (1, 1),
            timing: Some(ProductionTiming::default()),
            key,
            dir_id: 0x1f,
            job_id,
            original_name: from.into(),
            original_size: Some(5),
            new_name: to.into(),
            new_size: 5,
            return_code: 0,
            command: format!("rename {} {}", from, to),
        }
    }

    /// hello.txt goes to job a (renamed, delivered) and job b (deleted);
    /// other.txt is in a later batch and only queued.
    fn populate(afd: &mut Afd) {
        let logs = &mut afd.logs;
        logs.input(&input("hello.txt", 1)).unwrap();
        logs.distribution(&distribution("hello.txt", 1, vec![(0xa, 0), (0xb, 0)])).unwrap();
        logs.production(&rename("hello.txt", "HELLO.TXT", 0xa, JobKey::new(T, 1, 0))).unwrap();
        logs.input(&input("other.txt", 2)).unwrap();
        logs.distribution(&distribution("other.txt", 2, vec![(0xa, 0)])).unwrap();
        logs.output(&output("HELLO.TXT", 0xa, JobKey::new(T, 1, 0), "edge")).unwrap();
        logs.delete(&DeleteRecord {
            time: T + 40,
            host_alias: Some("gone".into()),
            reason: DeleteReason::HostDisabled.code(),
            filename: "hello.txt".into(),
            size: 5,
            job_id: 0xb,
            origin: Some((0x1f, JobKey::new(T, 1, 1))),
            user: "fd".into(),
            additional: None,
        })
        .unwrap();
    }

    fn store(afd: &Afd, alias: &str) -> LogStore {
        LogStore::open(alias, &afd.paths).unwrap()
    }

    #[test]
    fn test_forward_reaches_every_recipient() {
        let mut afd = afd();
        populate(&mut afd);
        let query = Query {
            masks: vec!["hello*".parse().unwrap()],
            ..Query::default()
        };
        let mut searcher = Searcher::new(store(&afd, "local"), &query);
        let traces = searcher.forward().unwrap();
        assert_eq!(traces.len(), 2);
        let delivered = traces.iter().find(|t| t.output.is_some()).unwrap();
        assert_eq!(delivered.production.len(), 1);
        assert_eq!(delivered.output.as_ref().unwrap().local_name, "HELLO.TXT");
        let deleted = traces.iter().find(|t| t.delete.is_some()).unwrap();
        assert_eq!(deleted.delete.as_ref().unwrap().job_id, 0xb);
        assert!(deleted.production.is_empty());
        assert!(!searcher.stats.partial());
    }

    #[test]
    fn test_lineage_round_trip() {
        let mut afd = afd();
        populate(&mut afd);
        let query = Query::default();
        let mut forward = Searcher::new(store(&afd, "local"), &query);
        let traces = forward.forward().unwrap();
        for trace in traces.iter().filter(|t| t.is_complete()) {
            let terminal = match (&trace.output, &trace.delete) {
                (Some(o), _) => Terminal::Output(o.clone()),
                (None, Some(d)) => Terminal::Delete(d.clone()),
                _ => unreachable!(),
            };
            let mut backward = Searcher::new(store(&afd, "local"), &query);
            let back = backward.resolve_back(terminal).unwrap().unwrap();
            assert_eq!(back.input, trace.input);
            assert_eq!(back.distribution, trace.distribution);
            assert_eq!(back.production, trace.production);
        }
        // other.txt never got further than distribution.
        let queued = traces.iter().find(|t| t.input.as_ref().unwrap().filename == "other.txt").unwrap();
        assert!(!queued.is_complete());
        assert!(!queued.cut);
    }

    #[test]
    fn test_backward_and_unique_less_deletes() {
        let mut afd = afd();
        populate(&mut afd);
        afd.logs
            .delete(&DeleteRecord {
                time: T + 50,
                host_alias: None,
                reason: DeleteReason::DupInput.code(),
                filename: "dup.bin".into(),
                size: 4,
                job_id: 0,
                origin: Some((0x1f, JobKey::new(T + 50, 0, 0))),
                user: "dir_check".into(),
                additional: None,
            })
            .unwrap();

        let mut query = Query {
            direction: Direction::Backward,
            ..Query::default()
        };
        let traces = Searcher::new(store(&afd, "local"), &query).backward().unwrap();
        assert_eq!(traces.len(), 2);
        assert!(traces.iter().all(|t| t.input.is_some()));

        query.unique_less_deletes = DeleteMatchPolicy::Hit;
        let traces = Searcher::new(store(&afd, "local"), &query).backward().unwrap();
        assert_eq!(traces.len(), 3);
        let dup = traces.last().unwrap();
        assert_eq!(dup.delete.as_ref().unwrap().filename, "dup.bin");
        assert!(dup.input.is_none());
    }

    #[test]
    fn test_filters_and_log_subset() {
        let mut afd = afd();
        populate(&mut afd);
        let query = Query {
            hosts: vec!["edge".parse().unwrap()],
            ..Query::default()
        };
        let traces = Searcher::new(store(&afd, "local"), &query).forward().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].host_alias(), Some("edge"));

        // Without the distribution log the jobs come from the later stages.
        let query = Query {
            logs: [LogKind::Input, LogKind::Output].into_iter().collect(),
            masks: vec!["hello.txt".parse().unwrap()],
            ..Query::default()
        };
        let traces = Searcher::new(store(&afd, "local"), &query).forward().unwrap();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].distribution.is_none());
        assert!(traces[0].output.is_none());
    }

    #[test]
    fn test_max_diff_time_cuts_traces() {
        let mut afd = afd();
        populate(&mut afd);
        let query = Query {
            masks: vec!["hello.txt".parse().unwrap()],
            max_diff_time: Some(10),
            ..Query::default()
        };
        let mut searcher = Searcher::new(store(&afd, "local"), &query);
        let traces = searcher.forward().unwrap();
        assert!(traces.iter().all(|t| t.cut && !t.is_complete()));
        assert!(searcher.stats.partial());
    }

    #[test]
    fn test_search_budget_exhaustion() {
        let mut afd = afd();
        populate(&mut afd);
        let query = Query {
            max_search_time: Some(Duration::ZERO),
            ..Query::default()
        };
        let mut searcher = Searcher::new(store(&afd, "local"), &query);
        assert!(searcher.forward().unwrap().is_empty());
        assert!(searcher.stats.exhausted);
    }

    #[test]
    fn test_remote_hop() {
        let mut local = afd();
        populate(&mut local);
        let mut edge = afd();
        edge.logs
            .input(&InputRecord {
                time: T + 31,
                filename: "HELLO.TXT".into(),
                size: 5,
                dir_id: 0x2e,
                unique_number: 9,
            })
            .unwrap();
        let hosts = HostList::parse(&format!("edge {}\n", edge.paths.root().display())).unwrap();

        let query = Query {
            masks: vec!["hello.txt".parse().unwrap()],
            ..Query::default()
        };
        let traces = Searcher::new(store(&local, "local"), &query).forward().unwrap();
        let hops = follow_remote(&traces, &hosts, &query, None).unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].afd, "edge");
        assert_eq!(hops[0].input.as_ref().unwrap().dir_id, 0x2e);

        let stopped = follow_remote(&traces, &hosts, &query, Some("%local")).unwrap();
        assert!(stopped.is_empty());
    }

    #[test]
    fn test_separator_from_config() {
        let afd = afd();
        fs::write(afd.paths.etc_dir().join("AFD_CONFIG.yaml"), "logging:\n  separator: \";\"\n").unwrap();
        assert_eq!(store(&afd, "local").sep, b';');
        fs::write(afd.paths.etc_dir().join("AFD_CONFIG.toml"), "[logging]\nseparator = \"ab\"\n").unwrap();
        assert!(LogStore::open("local", &afd.paths).is_err());
    }
}
