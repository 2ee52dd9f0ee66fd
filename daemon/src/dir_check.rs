//! The pickup engine: one scan of one directory entry, and the worker loop
//! that runs scans for the entries assigned to this process.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone, Timelike};
use common::job::batch_dir_name;
use common::logs::{
    DeleteReason, DeleteRecord, DistributionRecord, DistributionType, EventAction, EventClass, InputRecord, LogKind,
    LogSet,
};
use common::rules::{DupAction, DupCheck, FileGroupIdx};
use common::{dir_flags, DirIdx, DirStatus, JobKey, RuleSet, ScanCommit, StatusArea, UniqueCounter, WorkPaths};

use crate::config::AfdConfig;
use crate::dupcheck::{self, DupStore};
use crate::fanout::{Batch, BatchFile, FanOut, Job, JobState, PROCESS_NAME};
use crate::filters::{self, Candidate, Credentials};
use crate::gates::{self, Gate};
use crate::hooks::Hooks;
use crate::migrate::{self, Migrator, MoveError};
use crate::scheduler;
use crate::signals;

/// Scans that hit an end-character mismatch come back this much earlier.
const END_CHAR_RECHECK: i64 = 5;

/// What one scan did, for the caller and for tests.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub accepted: Vec<String>,
    pub bytes: u64,
    pub jobs: Vec<Job>,
    /// Set when a gate kept the scan from picking anything up.
    pub gate: Option<Gate>,
    pub max_copied: bool,
    pub rescan_soon: bool,
    pub errors: u32,
    pub quiesced: bool,
}

/// Everything a dir_check worker holds attached while it runs.
pub struct DirCheck {
    paths: WorkPaths,
    config: AfdConfig,
    rules: Arc<RuleSet>,
    status: StatusArea,
    logs: LogSet,
    counter: UniqueCounter,
    hooks: Hooks,
    creds: Credentials,
    cap_chown: bool,
    quiesce: Box<dyn Fn() -> bool + Send>,
}

fn local_minute_of_day(now: i64) -> u32 {
    Local
        .timestamp_opt(now, 0)
        .single()
        .map_or(0, |t| t.hour() * 60 + t.minute())
}

fn is_no_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC)
}

/// Lineage logs written by the pickup engine.
pub const PICKUP_LOGS: [LogKind; 5] = [
    LogKind::Input,
    LogKind::Distribution,
    LogKind::Production,
    LogKind::Delete,
    LogKind::Event,
];

impl DirCheck {
    /// Attaches to the work directory using an already built rule set.
    pub fn new(paths: WorkPaths, config: AfdConfig, rules: RuleSet) -> Result<Self> {
        let status = StatusArea::attach(&paths.dir_status_file(), &paths.host_status_file())
            .context("Failed to attach status tables")?;
        let sep = config.logging.separator_byte()?;
        let logging = config.logging.clone();
        let logs = LogSet::open(&paths.log_dir(), &PICKUP_LOGS, sep, |kind| logging.policy(kind))
            .context("Failed to open lineage logs")?;
        let counter = UniqueCounter::attach(&paths.counter_file()).context("Failed to attach unique counter")?;
        Ok(Self {
            hooks: Hooks::new(config.actions.clone()),
            paths,
            config,
            rules: Arc::new(rules),
            status,
            logs,
            counter,
            creds: Credentials::current(),
            cap_chown: migrate::holds_cap_chown(),
            quiesce: Box::new(signals::quiesce_requested),
        })
    }

    /// Attaches and loads the rule set the supervisor published.
    pub fn attach(paths: WorkPaths, config: AfdConfig) -> Result<Self> {
        let rules = RuleSet::load(&paths.rule_set_file()).context("Failed to load rule set")?;
        Self::new(paths, config, rules)
    }

    pub fn with_quiesce(mut self, check: impl Fn() -> bool + Send + 'static) -> Self {
        self.quiesce = Box::new(check);
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn status(&self) -> &StatusArea {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusArea {
        &mut self.status
    }

    /// Picks up a new configuration generation.
    pub fn reload(&mut self, config: AfdConfig) -> Result<()> {
        let rules = RuleSet::load(&self.paths.rule_set_file()).context("Failed to reload rule set")?;
        self.status.refresh()?;
        log::info!(
            "Reloaded configuration generation {} ({} directories)",
            rules.generation,
            rules.dirs.len()
        );
        self.rules = Arc::new(rules);
        self.hooks = Hooks::new(config.actions.clone());
        self.config = config;
        Ok(())
    }

    fn emit(&mut self, now: i64, action: EventAction, alias: &str, text: Option<String>) {
        self.hooks
            .emit(&mut self.logs, now, EventClass::Directory, action, alias, text);
    }

    /// Counts one error and raises ERROR_SET once the limit is reached.
    fn note_error(&mut self, sidx: usize, alias: &str, max_errors: u32, now: i64) -> Result<()> {
        let counter = self.status.increment_errors(sidx)?;
        if counter >= max_errors {
            let old = self.status.set_dir_flags(sidx, dir_flags::ERROR_SET)?;
            if old & dir_flags::ERROR_SET == 0 {
                self.status.set_dir_status(sidx, DirStatus::Error)?;
                self.emit(now, EventAction::ErrorStart, alias, Some(format!("{} errors", counter)));
            }
        }
        Ok(())
    }

    fn recipient_jobs(rules: &RuleSet, groups: &[FileGroupIdx]) -> Vec<(u32, u32)> {
        groups
            .iter()
            .flat_map(|&fg| rules.recipients_of(fg))
            .map(|r| (rules[r].job_id, 0))
            .collect()
    }

    fn pickup_delete(&mut self, now: i64, dir_id: u32, file: &Candidate, reason: DeleteReason, additional: Option<String>) -> Result<()> {
        self.logs.delete(&DeleteRecord {
            time: now,
            host_alias: None,
            reason: reason.code(),
            filename: file.name.clone(),
            size: file.size,
            job_id: 0,
            origin: Some((dir_id, JobKey::new(now, 0, 0))),
            user: PROCESS_NAME.to_string(),
            additional,
        })?;
        Ok(())
    }

    fn unlink(file: &Candidate) -> bool {
        match fs::remove_file(&file.path) {
            Ok(()) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {}", file.path.display(), e);
                }
                false
            }
        }
    }

    fn ensure_paused_dir(path: &Path, group_write: bool) -> io::Result<()> {
        let mode = if group_write { 0o770 } else { 0o700 };
        match DirBuilder::new().mode(mode).create(path) {
            Ok(()) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Creates `tmp/<t>_<u>/`, sleeping and retrying while the disk is full.
    fn create_batch(&mut self, fs_root: &Path, now: i64, alias: &str) -> Result<Option<(Batch, u64)>> {
        let tmp = WorkPaths::tmp_dir(fs_root);
        let amg = &self.config.amg;
        let (retries, pause) = (amg.max_enospc_retries, Duration::from_secs(amg.disk_full_rescan_time));
        let mut attempt = 0;
        loop {
            let (time, unique) = self.counter.next(now)?;
            let dir = tmp.join(batch_dir_name(time, unique));
            let created = fs::create_dir_all(&tmp).and_then(|_| fs::create_dir(&dir));
            match created {
                Ok(()) => {
                    let dev = fs::metadata(&dir).map(|m| m.dev()).unwrap_or(0);
                    return Ok(Some((
                        Batch {
                            time,
                            unique,
                            dir,
                            files: Vec::new(),
                        },
                        dev,
                    )));
                }
                Err(e) if is_no_space(&e) && attempt < retries => {
                    attempt += 1;
                    log::warn!(
                        "{}: no space to create {}, retry {}/{} in {}s",
                        alias,
                        dir.display(),
                        attempt,
                        retries,
                        pause.as_secs()
                    );
                    thread::sleep(pause);
                }
                Err(e) if is_no_space(&e) => {
                    log::error!("{}: disk still full after {} retries, giving up this scan", alias, retries);
                    return Ok(None);
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to create {}", dir.display())),
            }
        }
    }

    /// Runs one pickup cycle for `dir`.
    pub fn scan_dir(&mut self, dir: DirIdx, now: i64) -> Result<ScanReport> {
        let rules = Arc::clone(&self.rules);
        let entry = &rules[dir];
        let policy = &entry.policy;
        let remote = entry.is_remote();
        let alias = entry.alias.as_str();
        let mut report = ScanReport::default();

        let sidx = self
            .status
            .dir_index(entry.dir_id)
            .with_context(|| format!("{} has no status row", alias))?;
        let row = self.status.dir(sidx);
        let stopped = row.has(dir_flags::DIR_STOPPED);
        let all_disabled = row.has(dir_flags::ALL_DISABLED);

        if remote {
            fs::create_dir_all(&entry.path)
                .with_context(|| format!("Failed to create {}", entry.path.display()))?;
        }
        let paused_alias = entry.host.map_or(alias, |h| rules[h].alias.as_str());
        let paused_dir = entry.paused_dir(paused_alias);

        let listing = match filters::list_candidates(&entry.path, policy) {
            Ok(listing) => listing,
            Err(e) => {
                log::error!("{}: failed to read {}: {}", alias, entry.path.display(), e);
                report.errors += 1;
                self.note_error(sidx, alias, policy.max_errors, now)?;
                self.status.set_next_check(sidx, now + policy.scan_interval as i64)?;
                return Ok(report);
            }
        };
        let mut commit = ScanCommit {
            files_in_dir: listing.len() as u32,
            bytes_in_dir: listing.iter().map(|f| f.size).sum(),
            ..ScanCommit::default()
        };

        let mut candidates = Vec::new();
        if stopped {
            Self::ensure_paused_dir(&paused_dir, policy.group_write)
                .with_context(|| format!("Failed to create {}", paused_dir.display()))?;
        } else {
            let gate = gates::evaluate(&rules, dir, &listing, &self.creds, now);
            if gate != Gate::Open {
                log::debug!("{}: {:?}", alias, gate);
                report.gate = Some(gate);
                self.status.commit_scan(sidx, &commit)?;
                self.status.set_next_check(sidx, now + policy.scan_interval as i64)?;
                return Ok(report);
            }
            if paused_dir.is_dir() {
                match filters::list_candidates(&paused_dir, policy) {
                    Ok(held) if !held.is_empty() => {
                        log::info!("{}: draining {} files from {}", alias, held.len(), paused_dir.display());
                        candidates.extend(held);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("{}: failed to read {}: {}", alias, paused_dir.display(), e),
                }
            }
        }
        candidates.extend(listing);

        let migrator = Migrator {
            force_copy: policy.force_copy,
            cap_chown: self.cap_chown,
        };
        let mut dup_store: Option<DupStore> = None;
        let mut batch: Option<(Batch, u64)> = None;
        let mut accepted = 0u32;

        for file in &candidates {
            if (self.quiesce)() {
                report.quiesced = true;
                break;
            }
            if filters::ignored(policy, file, now, remote) {
                continue;
            }
            if !self.creds.can_read(file) {
                if policy.delete_unreadable_files && file.age(now) > policy.unknown_file_time && Self::unlink(file) {
                    self.pickup_delete(now, entry.dir_id, file, DeleteReason::UnreadableFile, None)?;
                }
                continue;
            }
            let groups = filters::matching_groups(&rules, dir, &file.name);
            if groups.is_empty() {
                let age = file.age(now);
                if policy.delete_unknown_files
                    && age > policy.unknown_file_time
                    && age >= self.config.amg.default_transfer_timeout
                    && Self::unlink(file)
                {
                    self.pickup_delete(
                        now,
                        entry.dir_id,
                        file,
                        DeleteReason::UnknownFile,
                        Some(format!(">{}", policy.unknown_file_time)),
                    )?;
                }
                continue;
            }
            if all_disabled && policy.remove_on_disabled {
                if Self::unlink(file) {
                    self.logs.distribution(&DistributionRecord {
                        time: now,
                        dis_type: DistributionType::Disabled,
                        filename: file.name.clone(),
                        input_time: now,
                        dir_id: entry.dir_id,
                        unique_number: 0,
                        size: file.size,
                        jobs: Self::recipient_jobs(&rules, &groups),
                    })?;
                    self.pickup_delete(now, entry.dir_id, file, DeleteReason::HostDisabled, None)?;
                }
                continue;
            }
            if let Some(end) = policy.end_character {
                match filters::ends_with(&file.path, end) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!("{}: {} does not end with 0x{:02x} yet", alias, file.name, end);
                        report.rescan_soon = true;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        log::warn!("{}: failed to read end of {}: {}", alias, file.name, e);
                        continue;
                    }
                }
            }
            if accepted > 0 && report.bytes + file.size > policy.max_copied_file_size {
                report.max_copied = true;
                break;
            }

            let mut fingerprint = None;
            if let Some(dc) = policy.dup_check {
                if dup_store.is_none() {
                    let crc_file = self.paths.crc_file(entry.dir_id);
                    if let Some(parent) = crc_file.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    dup_store = Some(DupStore::attach(&crc_file)?);
                }
                let crc = match dupcheck::fingerprint(&file.path, &file.name, file.size, dc.mode) {
                    Ok(crc) => crc,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        log::warn!("{}: failed to fingerprint {}: {}", alias, file.name, e);
                        continue;
                    }
                };
                let duplicate = match dup_store.as_mut() {
                    Some(store) => store.is_duplicate(crc, dc.mode, now, dc.timeout)?,
                    None => false,
                };
                if duplicate {
                    if self.handle_duplicate(now, dir, &groups, file, dc)? {
                        continue;
                    }
                } else {
                    fingerprint = Some((crc, dc));
                }
            }

            let moved = if stopped {
                self.park(&migrator, now, dir, &groups, file, &paused_dir).map(|_| (now, 0))
            } else {
                if batch.is_none() {
                    let created = self.create_batch(&entry.fs_root, now, alias);
                    if !matches!(created, Ok(Some(_))) {
                        // The file stays in the source; it must not count as seen.
                        if let (Some((crc, dc)), Some(store)) = (fingerprint, dup_store.as_mut()) {
                            store.withdraw(crc, dc.mode)?;
                        }
                    }
                    batch = created?;
                    if batch.is_none() {
                        break;
                    }
                }
                match batch.as_mut() {
                    Some((b, dev)) => {
                        let same_dev = *dev == file.dev;
                        migrator
                            .move_file(&file.path, &b.dir.join(&file.name), same_dev)
                            .map(|_| (b.time, b.unique))
                    }
                    None => continue,
                }
            };

            match moved {
                Ok((input_time, unique)) => {
                    if !stopped {
                        self.logs.input(&InputRecord {
                            time: input_time,
                            filename: file.name.clone(),
                            size: file.size,
                            dir_id: entry.dir_id,
                            unique_number: unique,
                        })?;
                        if let Some((b, _)) = batch.as_mut() {
                            b.files.push(BatchFile {
                                name: file.name.clone(),
                                size: file.size,
                                groups,
                            });
                        }
                    }
                    accepted += 1;
                    report.bytes += file.size;
                    report.accepted.push(file.name.clone());
                    if accepted >= policy.max_copied_files || report.bytes >= policy.max_copied_file_size {
                        report.max_copied = true;
                        break;
                    }
                }
                Err(e) => {
                    if let (Some((crc, dc)), Some(store)) = (fingerprint, dup_store.as_mut()) {
                        store.withdraw(crc, dc.mode)?;
                    }
                    if let MoveError::SourceMissing(_) = e {
                        log::debug!("{}: {} vanished before pickup", alias, file.name);
                        continue;
                    }
                    log::warn!("{}: failed to pick up {}: {}", alias, file.name, e);
                    report.errors += 1;
                    self.note_error(sidx, alias, policy.max_errors, now)?;
                }
            }
        }
        if let Some(store) = dup_store {
            store.detach();
        }

        if let Some((b, _)) = batch {
            if b.files.is_empty() {
                let _ = fs::remove_dir(&b.dir);
            } else {
                let mut fanout = FanOut {
                    rules: &rules,
                    paths: &self.paths,
                    logs: &mut self.logs,
                    now,
                    minute_of_day: local_minute_of_day(now),
                };
                report.jobs = fanout.run(dir, &b)?;
                for job in &report.jobs {
                    if job.state == JobState::Failed {
                        continue;
                    }
                    let host = &rules[rules[job.recipient].host];
                    if let Some(hidx) = self.status.host_index(&host.alias) {
                        self.status.add_jobs_queued(hidx, 1)?;
                    }
                }
            }
        }

        self.finish_scan(sidx, dir, now, &mut commit, &report)?;
        Ok(report)
    }

    /// Applies a duplicate's action. True when the file is dealt with.
    fn handle_duplicate(
        &mut self,
        now: i64,
        dir: DirIdx,
        groups: &[FileGroupIdx],
        file: &Candidate,
        dc: DupCheck,
    ) -> Result<bool> {
        let rules = Arc::clone(&self.rules);
        let entry = &rules[dir];
        match dc.action {
            DupAction::Delete => {
                if Self::unlink(file) {
                    self.pickup_delete(now, entry.dir_id, file, DeleteReason::DupInput, None)?;
                }
                Ok(true)
            }
            DupAction::Store => {
                let store = self.paths.store_dir(entry.dir_id);
                fs::create_dir_all(&store).with_context(|| format!("Failed to create {}", store.display()))?;
                match fs::rename(&file.path, store.join(&file.name)) {
                    Ok(()) => self.logs.distribution(&DistributionRecord {
                        time: now,
                        dis_type: DistributionType::DupCheckStore,
                        filename: file.name.clone(),
                        input_time: now,
                        dir_id: entry.dir_id,
                        unique_number: 0,
                        size: file.size,
                        jobs: Self::recipient_jobs(&rules, groups),
                    })?,
                    Err(e) => log::warn!("{}: failed to store duplicate {}: {}", entry.alias, file.name, e),
                }
                Ok(true)
            }
            DupAction::Warn => {
                log::warn!("{}: {} is a duplicate", entry.alias, file.name);
                Ok(false)
            }
        }
    }

    /// Moves a file of a stopped directory into its paused directory.
    fn park(
        &mut self,
        migrator: &Migrator,
        now: i64,
        dir: DirIdx,
        groups: &[FileGroupIdx],
        file: &Candidate,
        paused_dir: &Path,
    ) -> std::result::Result<(), MoveError> {
        let rules = Arc::clone(&self.rules);
        let entry = &rules[dir];
        migrator.move_file(&file.path, &paused_dir.join(&file.name), true)?;
        let record = DistributionRecord {
            time: now,
            dis_type: DistributionType::QueueStopped,
            filename: file.name.clone(),
            input_time: now,
            dir_id: entry.dir_id,
            unique_number: 0,
            size: file.size,
            jobs: Self::recipient_jobs(&rules, groups),
        };
        if let Err(e) = self.logs.distribution(&record) {
            log::error!("{}: {}", entry.alias, e);
        }
        Ok(())
    }

    fn finish_scan(
        &mut self,
        sidx: usize,
        dir: DirIdx,
        now: i64,
        commit: &mut ScanCommit,
        report: &ScanReport,
    ) -> Result<()> {
        let rules = Arc::clone(&self.rules);
        let entry = &rules[dir];
        let policy = &entry.policy;
        let alias = entry.alias.as_str();
        let picked = report.accepted.len() as u64;

        commit.files_received = picked;
        commit.bytes_received = report.bytes;
        commit.last_retrieval = (picked > 0).then_some(now);
        let before = self.status.dir(sidx);
        self.status.commit_scan(sidx, commit)?;

        if report.max_copied {
            let old = self.status.set_dir_flags(sidx, dir_flags::MAX_COPIED)?;
            if old & dir_flags::MAX_COPIED == 0 {
                self.emit(
                    now,
                    EventAction::MaxCopiedSet,
                    alias,
                    Some(format!("{} files {} bytes", picked, report.bytes)),
                );
            }
        } else {
            self.status.clear_dir_flags(sidx, dir_flags::MAX_COPIED)?;
        }
        if !report.quiesced {
            self.status.clear_dir_flags(sidx, dir_flags::INOTIFY_NEEDS_SCAN)?;
        }

        if picked > 0 {
            log::info!(
                target: "receive_log",
                "{:<16} Received {} files with {} bytes",
                alias,
                picked,
                report.bytes
            );
            let old = self
                .status
                .clear_dir_flags(sidx, dir_flags::INFO_TIME_REACHED | dir_flags::WARN_TIME_REACHED)?;
            if old & dir_flags::INFO_TIME_REACHED != 0 {
                self.emit(now, EventAction::InfoTimeUnset, alias, None);
            }
            if old & dir_flags::WARN_TIME_REACHED != 0 {
                if old & dir_flags::ERROR_SET == 0 {
                    self.status.set_dir_status(sidx, DirStatus::Normal)?;
                }
                self.emit(now, EventAction::WarnTimeUnset, alias, None);
            }
        } else if before.last_retrieval != 0 {
            let idle = (now - before.last_retrieval).max(0) as u64;
            if policy.info_time.map_or(false, |limit| idle > limit) && !before.has(dir_flags::INFO_TIME_REACHED) {
                self.status.set_dir_flags(sidx, dir_flags::INFO_TIME_REACHED)?;
                self.emit(now, EventAction::InfoTimeSet, alias, Some(format!("idle {}s", idle)));
            }
            if policy.warn_time.map_or(false, |limit| idle > limit) && !before.has(dir_flags::WARN_TIME_REACHED) {
                self.status.set_dir_flags(sidx, dir_flags::WARN_TIME_REACHED)?;
                if !before.has(dir_flags::ERROR_SET) {
                    self.status.set_dir_status(sidx, DirStatus::Warning)?;
                }
                self.emit(now, EventAction::WarnTimeSet, alias, Some(format!("idle {}s", idle)));
            }
        }

        if report.errors == 0 && before.error_counter > 0 {
            self.status.reset_errors(sidx)?;
            let old = self.status.clear_dir_flags(sidx, dir_flags::ERROR_SET)?;
            if old & dir_flags::ERROR_SET != 0 {
                let status = if old & dir_flags::WARN_TIME_REACHED != 0 && picked == 0 {
                    DirStatus::Warning
                } else {
                    DirStatus::Normal
                };
                self.status.set_dir_status(sidx, status)?;
            }
            self.emit(now, EventAction::ErrorEnd, alias, None);
        }

        let mut next = now + policy.scan_interval as i64;
        if report.rescan_soon {
            next = (next - END_CHAR_RECHECK).max(now);
        }
        self.status.set_next_check(sidx, next)?;
        Ok(())
    }
}

/// Worker process main loop: scans the entries of partition
/// `worker` of `workers` until asked to stop.
pub fn run_worker(paths: WorkPaths, config_path: Option<PathBuf>, worker: u32, workers: u32) -> Result<()> {
    signals::install_worker_handlers().context("Failed to install signal handlers")?;
    let config = AfdConfig::load(&paths.etc_dir(), config_path.as_deref())?;
    let tick = Duration::from_millis(config.amg.tick_interval_ms.max(100));
    let mut check = DirCheck::attach(paths.clone(), config)?;
    log::info!(
        "dir_check {}/{} started with {} directories",
        worker,
        workers,
        check.rules().dirs.len()
    );

    while !signals::quiesce_requested() {
        if signals::take_reload() {
            match AfdConfig::load(&paths.etc_dir(), config_path.as_deref()).and_then(|c| check.reload(c)) {
                Ok(()) => {}
                Err(e) => log::error!("Reload failed, keeping previous configuration: {:#}", e),
            }
        }
        let now = chrono::Utc::now().timestamp();
        let due = scheduler::due_dirs(check.rules(), check.status(), now, worker, workers);
        for dir in due {
            if signals::quiesce_requested() {
                break;
            }
            if let Err(e) = check.scan_dir(dir, now) {
                log::error!("Scan of {} failed: {:#}", check.rules()[dir].alias, e);
            }
        }
        thread::sleep(tick);
    }
    log::info!("dir_check {}/{} stopping", worker, workers);
    Ok(())
}
