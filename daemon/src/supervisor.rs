//! AMG supervisor: owns the configuration, publishes the rule set and the
//! status tables, runs the dir_check worker processes and reacts to signals.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone, Timelike};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use common::{dir_flags, NameRegistry, RuleSet, StatusArea, WorkPaths};

use crate::config::AfdConfig;
use crate::dir_config::{load_rule_set, RegistryIds};
use crate::watcher::{Change, DirWatcher};

const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

pub struct Supervisor {
    paths: WorkPaths,
    config_path: Option<PathBuf>,
    config: AfdConfig,
    rules: RuleSet,
    status: StatusArea,
    workers: Vec<Option<Child>>,
    generation: u64,
    reload_pending: bool,
}

fn minute_of_day(now: i64) -> u32 {
    Local
        .timestamp_opt(now, 0)
        .single()
        .map_or(0, |t| t.hour() * 60 + t.minute())
}

impl Supervisor {
    /// Creates the work directory layout, attaches the status tables and
    /// publishes the first configuration generation.
    pub fn start(paths: WorkPaths, config_path: Option<PathBuf>) -> Result<Self> {
        paths
            .create_all()
            .with_context(|| format!("Failed to create work directory {}", paths.root().display()))?;
        let status = StatusArea::attach(&paths.dir_status_file(), &paths.host_status_file())
            .context("Failed to attach status tables")?;
        let config = AfdConfig::load(&paths.etc_dir(), config_path.as_deref())?;
        let mut supervisor = Self {
            paths,
            config_path,
            config,
            rules: RuleSet::default(),
            status,
            workers: Vec::new(),
            generation: 0,
            reload_pending: false,
        };
        supervisor.reload()?;
        Ok(supervisor)
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

    /// Re-reads AFD_CONFIG and every DIR_CONFIG and publishes the result.
    pub fn reload(&mut self) -> Result<()> {
        let fresh = AfdConfig::load(&self.paths.etc_dir(), self.config_path.as_deref())?;
        self.config.merge(fresh);

        let mut dirs = NameRegistry::attach_dirs(&self.paths.dir_name_file())?;
        let mut hosts = NameRegistry::attach_hosts(&self.paths.host_name_file())?;
        let generation = self.generation + 1;
        let (rules, passwords) = {
            let mut ids = RegistryIds {
                dirs: &mut dirs,
                hosts: &mut hosts,
            };
            load_rule_set(&self.config, &self.paths, &mut ids, generation)?
        };
        dirs.detach();
        hosts.detach();

        passwords.save(&self.paths.password_file())?;
        rules.save(&self.paths.rule_set_file())?;

        let dir_rows: Vec<(u32, &str)> = rules.dirs.iter().map(|d| (d.dir_id, d.alias.as_str())).collect();
        let host_rows: Vec<(u32, &str)> = rules.hosts.iter().map(|h| (h.host_id, h.alias.as_str())).collect();
        self.status.rebuild(&dir_rows, &host_rows)?;
        for host in &rules.hosts {
            if let Some(idx) = self.status.host_index(&host.alias) {
                self.status.set_host_disabled(idx, host.disabled)?;
                self.status.set_host_toggle(idx, u32::from(host.toggle))?;
            }
        }
        self.status.flush()?;

        log::info!(
            "Configuration generation {}: {} directories, {} recipients, {} hosts, {} passwords",
            generation,
            rules.dirs.len(),
            rules.recipients.len(),
            rules.hosts.len(),
            passwords.len()
        );
        self.generation = generation;
        self.rules = rules;
        self.update_disabled_flags()?;
        Ok(())
    }

    /// Sets ALL_DISABLED on directories whose every recipient host is disabled.
    pub fn update_disabled_flags(&mut self) -> Result<()> {
        let rules = &self.rules;
        let status = &mut self.status;
        for dir in rules.dir_indices() {
            let Some(sidx) = status.dir_index(rules[dir].dir_id) else {
                continue;
            };
            let disabled = rules.all_hosts_disabled(dir, |h| {
                let host = &rules[h];
                status
                    .host_index(&host.alias)
                    .map_or(host.disabled, |idx| status.host(idx).is_disabled())
            });
            let flags = status.dir(sidx).dir_flags;
            match (disabled, flags & dir_flags::ALL_DISABLED != 0) {
                (true, false) => {
                    status.set_dir_flags(sidx, dir_flags::ALL_DISABLED)?;
                    log::info!("{}: all recipient hosts disabled", rules[dir].alias);
                }
                (false, true) => {
                    status.clear_dir_flags(sidx, dir_flags::ALL_DISABLED)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Flags a directory for an early scan.
    pub fn mark_changed(&mut self, dir_id: u32) -> Result<()> {
        if let Some(sidx) = self.status.dir_index(dir_id) {
            self.status.set_dir_flags(sidx, dir_flags::INOTIFY_NEEDS_SCAN)?;
        }
        Ok(())
    }

    /// Moves jobs waiting in `time/` whose window has opened to `outgoing/`.
    /// Jobs whose route no longer exists are released too.
    pub fn release_time_jobs(&self, now: i64) -> Result<usize> {
        let minute = minute_of_day(now);
        let roots: BTreeSet<&Path> = self.rules.dirs.iter().map(|d| d.fs_root.as_path()).collect();
        let mut released = 0;
        for root in roots {
            let time_dir = WorkPaths::time_dir(root);
            let Ok(job_dirs) = fs::read_dir(&time_dir) else {
                continue;
            };
            for job_dir in job_dirs.flatten() {
                let name = job_dir.file_name().to_string_lossy().into_owned();
                let open = u32::from_str_radix(&name, 16)
                    .ok()
                    .and_then(|job_id| self.rules.recipient_by_job(job_id))
                    .and_then(|r| self.rules[self.rules[r].dest_group].time_filter())
                    .map_or(true, |tf| tf.window_open(minute));
                if !open {
                    continue;
                }
                let outgoing = WorkPaths::outgoing_dir(root).join(&name);
                fs::create_dir_all(&outgoing).with_context(|| format!("Failed to create {}", outgoing.display()))?;
                for key in fs::read_dir(job_dir.path())?.flatten() {
                    let target = outgoing.join(key.file_name());
                    match fs::rename(key.path(), &target) {
                        Ok(()) => released += 1,
                        Err(e) => log::warn!("Failed to release {}: {}", key.path().display(), e),
                    }
                }
                let _ = fs::remove_dir(job_dir.path());
            }
        }
        if released > 0 {
            log::info!("Released {} time jobs", released);
        }
        Ok(released)
    }

    /// Removes staging directories left empty by an interrupted scan.
    pub fn sweep_empty_staging(&self) -> usize {
        let roots: BTreeSet<PathBuf> = self
            .rules
            .dirs
            .iter()
            .map(|d| d.fs_root.clone())
            .chain(std::iter::once(self.paths.files_dir()))
            .collect();
        let mut removed = 0;
        for root in roots {
            let Ok(entries) = fs::read_dir(WorkPaths::tmp_dir(&root)) else {
                continue;
            };
            for entry in entries.flatten() {
                // remove_dir only succeeds on an empty directory
                if fs::remove_dir(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn spawn_worker(&self, worker: usize) -> Result<Child> {
        let exe = std::env::current_exe().context("Failed to locate own executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("dir-check")
            .arg("--worker")
            .arg(worker.to_string())
            .arg("--workers")
            .arg(self.workers.len().to_string())
            .arg("--work-dir")
            .arg(self.paths.root());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start dir_check worker {}", worker))?;
        log::info!("Started dir_check worker {} (pid {:?})", worker, child.id());
        Ok(child)
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let count = self.config.amg.dir_check_workers.max(1) as usize;
        self.workers = (0..count).map(|_| None).collect();
        for i in 0..count {
            self.workers[i] = Some(self.spawn_worker(i)?);
        }
        Ok(())
    }

    fn respawn_dead_workers(&mut self) {
        for i in 0..self.workers.len() {
            let exited = match self.workers[i].as_mut().map(|c| c.try_wait()) {
                Some(Ok(Some(status))) => {
                    log::warn!("dir_check worker {} exited with {}, restarting", i, status);
                    true
                }
                Some(Ok(None)) => false,
                Some(Err(e)) => {
                    log::error!("Failed to poll dir_check worker {}: {}", i, e);
                    false
                }
                None => true,
            };
            if exited {
                match self.spawn_worker(i) {
                    Ok(child) => self.workers[i] = Some(child),
                    Err(e) => {
                        log::error!("{:#}", e);
                        self.workers[i] = None;
                    }
                }
            }
        }
    }

    fn signal_workers(&self, sig: Signal) {
        for child in self.workers.iter().flatten() {
            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
                    log::warn!("Failed to send {} to worker {}: {}", sig, pid, e);
                }
            }
        }
    }

    async fn stop_workers(&mut self) {
        self.signal_workers(Signal::SIGTERM);
        for (i, slot) in self.workers.iter_mut().enumerate() {
            let Some(child) = slot.as_mut() else {
                continue;
            };
            match tokio::time::timeout(WORKER_STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => log::info!("dir_check worker {} stopped ({})", i, status),
                Ok(Err(e)) => log::error!("Failed to wait for worker {}: {}", i, e),
                Err(_) => {
                    log::warn!("dir_check worker {} did not stop in time, killing it", i);
                    let _ = child.kill().await;
                }
            }
            *slot = None;
        }
    }

    fn start_watcher(&self, tx: &UnboundedSender<Change>) -> Option<DirWatcher> {
        match DirWatcher::start(&self.rules, &self.paths.etc_dir(), tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Running without file system watcher: {:#}", e);
                None
            }
        }
    }

    async fn apply_reload(&mut self, tx: &UnboundedSender<Change>, watcher: &mut Option<DirWatcher>) {
        let before = self.workers.len();
        if let Err(e) = self.reload() {
            log::error!("Reload failed, keeping generation {}: {:#}", self.generation, e);
            return;
        }
        *watcher = self.start_watcher(tx);
        let wanted = self.config.amg.dir_check_workers.max(1) as usize;
        if wanted != before {
            log::info!("Worker count changed from {} to {}", before, wanted);
            self.stop_workers().await;
            if let Err(e) = self.spawn_workers() {
                log::error!("{:#}", e);
            }
        } else {
            self.signal_workers(Signal::SIGHUP);
        }
    }

    fn on_tick(&mut self, now: i64) {
        self.respawn_dead_workers();
        if let Err(e) = self.update_disabled_flags() {
            log::error!("Failed to update directory flags: {:#}", e);
        }
        if let Err(e) = self.release_time_jobs(now) {
            log::error!("Failed to release time jobs: {:#}", e);
        }
    }

    /// Runs until SIGTERM or SIGINT.
    pub async fn run(mut self) -> Result<()> {
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut int = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut hup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        let (tx, mut rx) = unbounded_channel();
        let mut watcher = self.start_watcher(&tx);

        self.spawn_workers()?;
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.amg.tick_interval_ms.max(100)));

        loop {
            tokio::select! {
                _ = term.recv() => {
                    log::info!("SIGTERM received, quiescing");
                    break;
                }
                _ = int.recv() => {
                    log::info!("SIGINT received, quiescing");
                    break;
                }
                _ = hup.recv() => {
                    self.apply_reload(&tx, &mut watcher).await;
                }
                Some(change) = rx.recv() => match change {
                    Change::Directory(dir_id) => {
                        if let Err(e) = self.mark_changed(dir_id) {
                            log::warn!("Failed to flag directory {:x}: {:#}", dir_id, e);
                        }
                    }
                    Change::Config => self.reload_pending = true,
                },
                _ = tick.tick() => {
                    if std::mem::take(&mut self.reload_pending) {
                        log::info!("Configuration changed on disk, reloading");
                        self.apply_reload(&tx, &mut watcher).await;
                    }
                    self.on_tick(chrono::Utc::now().timestamp());
                }
            }
        }

        drop(watcher);
        self.stop_workers().await;
        let removed = self.sweep_empty_staging();
        if removed > 0 {
            log::info!("Removed {} empty staging directories", removed);
        }
        if let Err(e) = self.status.flush() {
            log::error!("Failed to flush status tables: {}", e);
        }
        log::info!("AMG stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(doc: &str) -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkPaths::new(dir.path().join("work"));
        paths.create_all().unwrap();
        let src = dir.path().join("in");
        fs::create_dir(&src).unwrap();
        fs::write(
            paths.etc_dir().join("DIR_CONFIG.yaml"),
            doc.replace("SRC", &src.display().to_string()),
        )
        .unwrap();
        let supervisor = Supervisor::start(paths, None).unwrap();
        (dir, supervisor)
    }

    const DOC: &str = r#"
hosts:
  - alias: gone
    disabled: true
directories:
  - location: SRC
    alias: IN
    file_groups:
      - masks: ["*"]
        destinations:
          - name: night
            recipients: ["sftp://gone/in"]
            options: ["time-filter 02:00-02:01"]
"#;

    #[test]
    fn test_start_publishes_rules_and_status() {
        let (_dir, supervisor) = setup(DOC);
        let published = RuleSet::load(&supervisor.paths.rule_set_file()).unwrap();
        assert_eq!(published.generation, 1);
        assert_eq!(published.dirs.len(), 1);
        let status = supervisor.status();
        assert_eq!(status.dir_count(), 1);
        let sidx = status.dir_index(published.dirs[0].dir_id).unwrap();
        assert!(status.dir(sidx).has(dir_flags::ALL_DISABLED));
        let hidx = status.host_index("gone").unwrap();
        assert!(status.host(hidx).is_disabled());
    }

    #[test]
    fn test_reload_keeps_ids_and_counters() {
        let (_dir, mut supervisor) = setup(DOC);
        let dir_id = supervisor.rules().dirs[0].dir_id;
        let sidx = supervisor.status().dir_index(dir_id).unwrap();
        supervisor.status_mut().increment_errors(sidx).unwrap();
        supervisor.reload().unwrap();
        assert_eq!(supervisor.rules().generation, 2);
        assert_eq!(supervisor.rules().dirs[0].dir_id, dir_id);
        let sidx = supervisor.status().dir_index(dir_id).unwrap();
        assert_eq!(supervisor.status().dir(sidx).error_counter, 1);
    }

    #[test]
    fn test_mark_changed_sets_scan_flag() {
        let (_dir, mut supervisor) = setup(DOC);
        let dir_id = supervisor.rules().dirs[0].dir_id;
        supervisor.mark_changed(dir_id).unwrap();
        let sidx = supervisor.status().dir_index(dir_id).unwrap();
        assert!(supervisor.status().dir(sidx).has(dir_flags::INOTIFY_NEEDS_SCAN));
    }

    #[test]
    fn test_orphaned_time_jobs_are_released() {
        let (_dir, supervisor) = setup(DOC);
        let root = supervisor.rules().dirs[0].fs_root.clone();
        let held = WorkPaths::time_dir(&root).join("deadbeef").join("10_1_0");
        fs::create_dir_all(&held).unwrap();
        fs::write(held.join("a"), b"x").unwrap();
        assert_eq!(supervisor.release_time_jobs(0).unwrap(), 1);
        assert!(WorkPaths::outgoing_dir(&root).join("deadbeef").join("10_1_0").join("a").exists());
        assert!(!WorkPaths::time_dir(&root).join("deadbeef").exists());
    }

    #[test]
    fn test_sweep_keeps_committed_staging() {
        let (_dir, supervisor) = setup(DOC);
        let tmp = WorkPaths::tmp_dir(&supervisor.paths.files_dir());
        fs::create_dir_all(tmp.join("1_1")).unwrap();
        fs::create_dir_all(tmp.join("1_2")).unwrap();
        fs::write(tmp.join("1_2").join("f"), b"x").unwrap();
        assert_eq!(supervisor.sweep_empty_staging(), 1);
        assert!(tmp.join("1_2").join("f").exists());
    }
}
