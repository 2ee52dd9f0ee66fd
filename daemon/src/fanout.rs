//! Turning one staged batch into one job directory per recipient.
//!
//! Each recipient gets `tmp/<t>_<u>_<split>/` holding hard links to the
//! batch files its file group accepted. Local options run there, then the
//! directory is renamed in one step to `outgoing/<job-id>/<t>_<u>_<split>/`
//! (or `time/…` while a time filter keeps the job back).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::logs::{DeleteReason, DeleteRecord, DistributionRecord, DistributionType, LogSet};
use common::paths::OPTIONS_FILE;
use common::rules::FileGroupIdx;
use common::{DirIdx, IoContext, JobKey, RecipientIdx, Result, RuleSet, WorkPaths};

use crate::production::{Producer, StagedFile};

pub const PROCESS_NAME: &str = "dir_check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub name: String,
    pub size: u64,
    pub groups: Vec<FileGroupIdx>,
}

/// Files staged together under `tmp/<t>_<u>/`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub time: i64,
    pub unique: u32,
    pub dir: PathBuf,
    pub files: Vec<BatchFile>,
}

impl Batch {
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    /// Waiting in `time/` for its time window.
    Held,
    /// A local option failed; the job sits in `store/`.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub recipient: RecipientIdx,
    pub key: JobKey,
    pub state: JobState,
    pub dir: PathBuf,
    pub files: usize,
}

pub struct FanOut<'a> {
    pub rules: &'a RuleSet,
    pub paths: &'a WorkPaths,
    pub logs: &'a mut LogSet,
    pub now: i64,
    pub minute_of_day: u32,
}

fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(src, dst).map(|_| ()),
    }
}

/// Moves a half-built split directory to `store`, relinking any batch file
/// it is missing.
fn keep_in_store(split_dir: &Path, batch_dir: &Path, store: &Path, files: &[&BatchFile]) -> io::Result<()> {
    if let Some(parent) = store.parent() {
        fs::create_dir_all(parent)?;
    }
    if split_dir.is_dir() {
        fs::rename(split_dir, store)?;
    } else {
        fs::create_dir(store)?;
    }
    for f in files {
        let dst = store.join(&f.name);
        if !dst.exists() {
            link_or_copy(&batch_dir.join(&f.name), &dst)?;
        }
    }
    Ok(())
}

impl FanOut<'_> {
    /// Creates every recipient job for `batch`, writes the distribution
    /// records and removes the batch directory.
    pub fn run(&mut self, dir: DirIdx, batch: &Batch) -> Result<Vec<Job>> {
        let rules = self.rules;
        let entry = &rules[dir];
        let fs_root = entry.fs_root.clone();

        let mut jobs = Vec::new();
        let mut split = 0u32;
        for &fg in &entry.file_groups {
            let subset: Vec<&BatchFile> = batch.files.iter().filter(|f| f.groups.contains(&fg)).collect();
            if subset.is_empty() {
                continue;
            }
            for recipient in rules.recipients_of(fg) {
                let key = JobKey::new(batch.time, batch.unique, split);
                split += 1;
                match self.make_job(dir, batch, &fs_root, recipient, key, &subset) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        log::error!(
                            "{}: failed to create job {} for {}: {}",
                            entry.alias,
                            key,
                            rules[recipient].url,
                            e
                        );
                        jobs.push(self.salvage_job(dir, batch, &fs_root, recipient, key, &subset)?);
                    }
                }
            }
        }

        self.log_distribution(dir, batch, &jobs)?;
        fs::remove_dir_all(&batch.dir).with_io_context(|| format!("remove {}", batch.dir.display()))?;
        Ok(jobs)
    }

    fn make_job(
        &mut self,
        dir: DirIdx,
        batch: &Batch,
        fs_root: &Path,
        recipient: RecipientIdx,
        key: JobKey,
        files: &[&BatchFile],
    ) -> Result<Job> {
        let rules = self.rules;
        let r = &rules[recipient];
        let dg = &rules[r.dest_group];
        let dir_id = rules[dir].dir_id;

        let split_dir = WorkPaths::tmp_dir(fs_root).join(key.to_string());
        fs::create_dir(&split_dir).with_io_context(|| format!("mkdir {}", split_dir.display()))?;
        for f in files {
            link_or_copy(&batch.dir.join(&f.name), &split_dir.join(&f.name))
                .with_io_context(|| format!("link {} into {}", f.name, split_dir.display()))?;
        }

        let staged = files
            .iter()
            .map(|f| StagedFile {
                name: f.name.clone(),
                size: f.size,
            })
            .collect();
        let producer = Producer {
            job_dir: &split_dir,
            key,
            dir_id,
            job_id: r.job_id,
            now: self.now,
        };
        let production = producer
            .run(dg.local_options(), staged)
            .with_io_context(|| format!("run options in {}", split_dir.display()))?;
        for record in &production.records {
            self.logs.production(record)?;
        }

        if let Some(failure) = production.failure {
            let store = self.paths.store_dir(dir_id).join(key.to_string());
            if let Some(parent) = store.parent() {
                fs::create_dir_all(parent).with_io_context(|| format!("mkdir {}", parent.display()))?;
            }
            fs::rename(&split_dir, &store).with_io_context(|| format!("store {}", store.display()))?;
            log::warn!(
                "{}: `{}` returned {}, job {} kept in {}: {}",
                rules[dir].alias,
                failure.command,
                failure.return_code,
                key,
                store.display(),
                failure.output.trim()
            );
            for f in &production.files {
                self.logs.delete(&DeleteRecord {
                    time: self.now,
                    host_alias: Some(rules[r.host].alias.clone()),
                    reason: DeleteReason::ExecFailedStored.code(),
                    filename: f.name.clone(),
                    size: f.size,
                    job_id: r.job_id,
                    origin: Some((dir_id, key)),
                    user: PROCESS_NAME.to_string(),
                    additional: Some(format!("{} [{}]", failure.command, failure.return_code)),
                })?;
            }
            return Ok(Job {
                recipient,
                key,
                state: JobState::Failed,
                dir: store,
                files: production.files.len(),
            });
        }

        let standard: Vec<String> = dg.standard_options().map(|o| o.to_string()).collect();
        if !standard.is_empty() {
            let path = split_dir.join(OPTIONS_FILE);
            fs::write(&path, standard.join("\n") + "\n").with_io_context(|| format!("write {}", path.display()))?;
        }

        let held = dg.time_filter().map_or(false, |tf| !tf.window_open(self.minute_of_day));
        let base = if held {
            WorkPaths::time_dir(fs_root)
        } else {
            WorkPaths::outgoing_dir(fs_root)
        };
        let target = base.join(format!("{:x}", r.job_id)).join(key.to_string());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_io_context(|| format!("mkdir {}", parent.display()))?;
        }
        fs::rename(&split_dir, &target).with_io_context(|| format!("commit {}", target.display()))?;

        Ok(Job {
            recipient,
            key,
            state: if held { JobState::Held } else { JobState::Queued },
            dir: target,
            files: production.files.len(),
        })
    }

    /// Parks the files of a job that could not be built in `store/` and
    /// closes their lineage with one Delete record each.
    fn salvage_job(
        &mut self,
        dir: DirIdx,
        batch: &Batch,
        fs_root: &Path,
        recipient: RecipientIdx,
        key: JobKey,
        files: &[&BatchFile],
    ) -> Result<Job> {
        let rules = self.rules;
        let r = &rules[recipient];
        let dir_id = rules[dir].dir_id;
        let split_dir = WorkPaths::tmp_dir(fs_root).join(key.to_string());
        let store = self.paths.store_dir(dir_id).join(key.to_string());

        let reason = match keep_in_store(&split_dir, &batch.dir, &store, files) {
            Ok(()) => {
                log::warn!("{}: job {} kept in {}", rules[dir].alias, key, store.display());
                DeleteReason::MkdirQueueError
            }
            Err(e) => {
                log::error!("{}: failed to keep job {} in {}: {}", rules[dir].alias, key, store.display(), e);
                let _ = fs::remove_dir_all(&split_dir);
                DeleteReason::InternalLinkFailed
            }
        };
        for f in files {
            self.logs.delete(&DeleteRecord {
                time: self.now,
                host_alias: Some(rules[r.host].alias.clone()),
                reason: reason.code(),
                filename: f.name.clone(),
                size: f.size,
                job_id: r.job_id,
                origin: Some((dir_id, key)),
                user: PROCESS_NAME.to_string(),
                additional: None,
            })?;
        }
        Ok(Job {
            recipient,
            key,
            state: JobState::Failed,
            dir: store,
            files: files.len(),
        })
    }

    fn log_distribution(&mut self, dir: DirIdx, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let rules = self.rules;
        let dir_id = rules[dir].dir_id;
        for file in &batch.files {
            let mut cycles: HashMap<u32, u32> = HashMap::new();
            let mut normal = Vec::new();
            let mut timed = Vec::new();
            for job in jobs {
                let r = &rules[job.recipient];
                if !file.groups.contains(&rules[r.dest_group].file_group) {
                    continue;
                }
                let cycle = cycles.entry(r.job_id).or_insert(0);
                let pair = (r.job_id, *cycle);
                *cycle += 1;
                match job.state {
                    JobState::Held => timed.push(pair),
                    JobState::Queued | JobState::Failed => normal.push(pair),
                }
            }
            for (dis_type, list) in [(DistributionType::Normal, normal), (DistributionType::TimeJob, timed)] {
                if list.is_empty() {
                    continue;
                }
                self.logs.distribution(&DistributionRecord {
                    time: self.now,
                    dis_type,
                    filename: file.name.clone(),
                    input_time: batch.time,
                    dir_id,
                    unique_number: batch.unique,
                    size: file.size,
                    jobs: list,
                })?;
            }
        }
        Ok(())
    }
}
