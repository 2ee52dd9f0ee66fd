//! End-to-end pickup cycles against a real temporary work directory.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use chrono::{Local, Timelike};
use common::logs::LogKind;
use common::{dir_flags, StatusArea, WorkPaths};
use filetime::FileTime;
use tempfile::TempDir;

use crate::config::AfdConfig;
use crate::dir_check::DirCheck;
use crate::dir_config::{DirConfigDoc, HashIds, RuleSetBuilder};
use crate::fanout::JobState;

struct Fixture {
    _tmp: TempDir,
    paths: WorkPaths,
    src: PathBuf,
    check: DirCheck,
}

impl Fixture {
    fn new(doc: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let paths = WorkPaths::new(tmp.path().join("work"));
        paths.create_all().unwrap();
        let src = tmp.path().join("in");
        fs::create_dir(&src).unwrap();
        let src = fs::canonicalize(&src).unwrap();

        let doc: DirConfigDoc = serde_yaml::from_str(&doc.replace("SRC", &src.display().to_string())).unwrap();
        let config = AfdConfig::default();
        let mut ids = HashIds;
        let mut builder = RuleSetBuilder::new(&config, &paths, &mut ids, 1);
        builder.add_document("DIR_CONFIG.yaml", &doc).unwrap();
        let (rules, _) = builder.finish();

        let mut status = StatusArea::attach(&paths.dir_status_file(), &paths.host_status_file()).unwrap();
        let dirs: Vec<(u32, &str)> = rules.dirs.iter().map(|d| (d.dir_id, d.alias.as_str())).collect();
        let hosts: Vec<(u32, &str)> = rules.hosts.iter().map(|h| (h.host_id, h.alias.as_str())).collect();
        status.rebuild(&dirs, &hosts).unwrap();
        status.detach();

        let check = DirCheck::new(paths.clone(), config, rules).unwrap().with_quiesce(|| false);
        Self {
            _tmp: tmp,
            paths,
            src,
            check,
        }
    }

    fn dir_id(&self) -> u32 {
        self.check.rules().dirs[0].dir_id
    }

    fn job_id(&self, n: usize) -> u32 {
        self.check.rules().recipients[n].job_id
    }

    fn put(&self, name: &str, data: &[u8]) {
        fs::write(self.src.join(name), data).unwrap();
    }

    fn log(&self, kind: LogKind) -> String {
        fs::read_to_string(self.paths.log_file(kind, 0)).unwrap_or_default()
    }

    fn row(&self) -> common::status::DirStatusRow {
        let status = self.check.status();
        status.dir(status.dir_index(self.dir_id()).unwrap())
    }

    fn set_flags(&mut self, flags: u32) {
        let dir_id = self.dir_id();
        let status = self.check.status_mut();
        let idx = status.dir_index(dir_id).unwrap();
        status.set_dir_flags(idx, flags).unwrap();
    }

    fn clear_flags(&mut self, flags: u32) {
        let dir_id = self.dir_id();
        let status = self.check.status_mut();
        let idx = status.dir_index(dir_id).unwrap();
        status.clear_dir_flags(idx, flags).unwrap();
    }

    fn files_root(&self) -> PathBuf {
        self.paths.files_dir()
    }

    fn tmp_entries(&self) -> usize {
        fs::read_dir(WorkPaths::tmp_dir(&self.files_root()))
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn basic(options: &str, masks: &str) -> String {
    format!(
        r#"
directories:
  - location: SRC
    alias: A
    options: {{ {} }}
    file_groups:
      - masks: [{}]
        destinations:
          - name: out
            recipients: ["file:///tmp/afd-out"]
"#,
        options, masks
    )
}

#[test]
fn test_basic_pickup() {
    let mut f = Fixture::new(&basic("", "\"*\""));
    f.put("hello.txt", b"hello");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();

    assert_eq!(report.accepted, vec!["hello.txt"]);
    assert_eq!(report.jobs.len(), 1);
    let key = report.jobs[0].key;
    assert_eq!(key.creation_time, t);
    assert_eq!(key.split_counter, 0);
    let (dir_id, job) = (f.dir_id(), f.job_id(0));
    assert_eq!(
        f.log(LogKind::Input),
        format!("{:x} hello.txt|5|{:x}|{:x}\n", t, dir_id, key.unique_number)
    );
    assert_eq!(
        f.log(LogKind::Distribution),
        format!("{:x} 0|hello.txt|{:x}|{:x}|{:x}|5|{:x}_0\n", t, t, dir_id, key.unique_number, job)
    );

    let committed = WorkPaths::outgoing_dir(&f.files_root())
        .join(format!("{:x}", job))
        .join(key.to_string());
    assert_eq!(fs::read(committed.join("hello.txt")).unwrap(), b"hello");
    assert!(!f.src.join("hello.txt").exists());
    assert_eq!(f.tmp_entries(), 0);

    let row = f.row();
    assert_eq!(row.files_received, 1);
    assert_eq!(row.bytes_received, 5);
    assert_eq!(row.last_retrieval, t);
    assert_eq!(row.next_check_time, t + 60);
    let receive = fs::read_to_string(f.paths.receive_log()).unwrap_or_default();
    assert!(receive.is_empty() || receive.contains("Received 1 files with 5 bytes"));
}

#[test]
fn test_filter_miss_only_counts() {
    let mut f = Fixture::new(&basic("", "\"*.csv\""));
    f.put("hello.txt", b"hello");
    let report = f.check.scan_dir(common::DirIdx(0), now()).unwrap();

    assert!(report.accepted.is_empty());
    assert_eq!(f.log(LogKind::Input), "");
    let row = f.row();
    assert_eq!(row.files_in_dir, 1);
    assert_eq!(row.bytes_in_dir, 5);
    assert_eq!(row.files_received, 0);
    assert!(f.src.join("hello.txt").exists());
}

#[test]
fn test_duplicate_delete() {
    let mut f = Fixture::new(&basic("dup_check: { timeout: 60, action: delete }", "\"*\""));
    let t = now();
    f.put("a.bin", b"same");
    let first = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    assert_eq!(first.accepted.len(), 1);

    f.put("a.bin", b"same");
    let second = f.check.scan_dir(common::DirIdx(0), t + 1).unwrap();
    assert!(second.accepted.is_empty());
    assert!(!f.src.join("a.bin").exists());

    assert_eq!(f.log(LogKind::Input).lines().count(), 1);
    assert_eq!(f.log(LogKind::Distribution).lines().count(), 1);
    assert_eq!(
        f.log(LogKind::Delete),
        format!("{:x} - 5|a.bin|4|0|{:x}|{:x}_0_0|dir_check\n", t + 1, f.dir_id(), t + 1)
    );
}

#[test]
fn test_duplicate_ttl_law() {
    let mut f = Fixture::new(&basic("dup_check: { timeout: 60, action: delete }", "\"*\""));
    let t = now();
    for (i, name) in ["x1", "x2", "x3"].iter().enumerate() {
        f.put(name, b"payload");
        f.check.scan_dir(common::DirIdx(0), t + i as i64).unwrap();
    }
    assert_eq!(f.log(LogKind::Input).lines().count(), 1);
    assert_eq!(f.log(LogKind::Delete).lines().count(), 2);
    assert!(f.log(LogKind::Delete).lines().all(|l| l.contains(" - 5|")));

    f.put("x4", b"payload");
    let later = f.check.scan_dir(common::DirIdx(0), t + 61).unwrap();
    assert_eq!(later.accepted, vec!["x4"]);
}

#[test]
fn test_file_cap_spans_cycles() {
    let mut f = Fixture::new(&basic("max_copied_files: 3", "\"*\""));
    for i in 1..=5 {
        f.put(&format!("f{}", i), b"12345");
    }
    let t = now();
    let first = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    assert_eq!(first.accepted, vec!["f1", "f2", "f3"]);
    assert!(first.max_copied);
    assert!(f.row().has(dir_flags::MAX_COPIED));
    assert_eq!(f.log(LogKind::Input).lines().count(), 3);
    assert!(f.log(LogKind::Event).contains(" D|E|7|A"));

    let second = f.check.scan_dir(common::DirIdx(0), t + 1).unwrap();
    assert_eq!(second.accepted, vec!["f4", "f5"]);
    assert!(!second.max_copied);
    assert!(!f.row().has(dir_flags::MAX_COPIED));
    assert_eq!(f.log(LogKind::Input).lines().count(), 5);
}

#[test]
fn test_byte_cap() {
    let mut f = Fixture::new(&basic("max_copied_file_size: 10", "\"*\""));
    for name in ["a", "b", "c"] {
        f.put(name, b"1234");
    }
    let report = f.check.scan_dir(common::DirIdx(0), now()).unwrap();
    assert_eq!(report.accepted, vec!["a", "b"]);
    assert!(report.bytes <= 10);
    assert!(report.max_copied);

    // A single file above the cap still moves, alone.
    let mut f = Fixture::new(&basic("max_copied_file_size: 10", "\"*\""));
    f.put("big", &[7u8; 20]);
    f.put("small", b"1");
    let report = f.check.scan_dir(common::DirIdx(0), now()).unwrap();
    assert_eq!(report.accepted, vec!["big"]);
    assert!(report.max_copied);
}

#[test]
fn test_end_character_recheck() {
    let mut f = Fixture::new(&basic("end_character: 10", "\"*\""));
    f.put("msg", b"abc\0");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    assert!(report.accepted.is_empty());
    assert!(report.rescan_soon);
    assert_eq!(f.row().next_check_time, t + 60 - 5);

    f.put("msg", b"abc\0\n");
    let report = f.check.scan_dir(common::DirIdx(0), t + 55).unwrap();
    assert_eq!(report.accepted, vec!["msg"]);
    assert_eq!(f.row().next_check_time, t + 55 + 60);
}

#[test]
fn test_disabled_hosts_remove_files() {
    let doc = r#"
hosts:
  - alias: dead
    disabled: true
directories:
  - location: SRC
    alias: A
    options: { remove_on_disabled: true }
    file_groups:
      - masks: ["*"]
        destinations:
          - recipients: ["sftp://dead/in"]
"#;
    let mut f = Fixture::new(doc);
    f.set_flags(dir_flags::ALL_DISABLED);
    f.put("a.txt", b"abc");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();

    assert!(report.accepted.is_empty());
    assert!(!f.src.join("a.txt").exists());
    let (dir_id, job) = (f.dir_id(), f.job_id(0));
    assert_eq!(
        f.log(LogKind::Distribution),
        format!("{:x} 3|a.txt|{:x}|{:x}|0|3|{:x}_0\n", t, t, dir_id, job)
    );
    assert_eq!(
        f.log(LogKind::Delete),
        format!("{:x} - 11|a.txt|3|0|{:x}|{:x}_0_0|dir_check\n", t, dir_id, t)
    );
    assert_eq!(f.log(LogKind::Input), "");
    assert_eq!(f.tmp_entries(), 0);
}

#[test]
fn test_job_keys_are_unique() {
    let doc = r#"
directories:
  - location: SRC
    alias: A
    file_groups:
      - masks: ["*"]
        destinations:
          - name: one
            recipients: ["file:///tmp/o1", "file:///tmp/o2"]
      - masks: ["*.txt"]
        destinations:
          - name: two
            recipients: ["file:///tmp/o3"]
"#;
    let mut f = Fixture::new(doc);
    let t = now();
    let mut keys = HashSet::new();
    let mut total = 0;
    for round in 0..3 {
        f.put(&format!("r{}.txt", round), b"data");
        f.put(&format!("r{}.bin", round), b"data");
        let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();
        assert_eq!(report.jobs.len(), 3);
        for job in &report.jobs {
            total += 1;
            keys.insert((job.key.creation_time, job.key.unique_number, job.key.split_counter));
        }
    }
    assert_eq!(keys.len(), total);

    // Each recipient sees only the files its group accepted.
    let dist = f.log(LogKind::Distribution);
    let bin_line = dist.lines().find(|l| l.contains("|r0.bin|")).unwrap();
    assert!(bin_line.contains(" 0-2|"));
    let txt_line = dist.lines().find(|l| l.contains("|r0.txt|")).unwrap();
    assert!(txt_line.contains(" 0-3|"));
}

#[test]
fn test_staged_content_matches_source() {
    let mut f = Fixture::new(&basic("", "\"*\""));
    let payloads: Vec<(String, Vec<u8>)> = (0..4)
        .map(|i| (format!("p{}", i), (0..(i * 1000 + 1)).map(|b| (b % 251) as u8).collect()))
        .collect();
    for (name, data) in &payloads {
        f.put(name, data);
    }
    let report = f.check.scan_dir(common::DirIdx(0), now()).unwrap();
    let job = &report.jobs[0];
    for (name, data) in &payloads {
        assert_eq!(&fs::read(job.dir.join(name)).unwrap(), data);
    }
}

#[test]
fn test_unknown_files_are_removed_when_old() {
    let mut f = Fixture::new(&basic(
        "delete_unknown_files: true, unknown_file_time: 100",
        "\"*.csv\"",
    ));
    let t = now();
    f.put("old.txt", b"stale");
    f.put("new.txt", b"fresh");
    filetime::set_file_mtime(f.src.join("old.txt"), FileTime::from_unix_time(t - 500, 0)).unwrap();
    f.check.scan_dir(common::DirIdx(0), t).unwrap();

    assert!(!f.src.join("old.txt").exists());
    assert!(f.src.join("new.txt").exists());
    let delete = f.log(LogKind::Delete);
    assert!(delete.starts_with(&format!("{:x} - 7|old.txt|5|0|", t)));
}

#[test]
fn test_paused_directory_parks_then_drains() {
    let mut f = Fixture::new(&basic("", "\"*\""));
    f.set_flags(dir_flags::DIR_STOPPED);
    f.put("held.txt", b"wait");
    let t = now();
    f.check.scan_dir(common::DirIdx(0), t).unwrap();

    let paused = f.src.parent().unwrap().join(".A");
    assert!(paused.join("held.txt").exists());
    assert_eq!(f.log(LogKind::Input), "");
    assert!(f.log(LogKind::Distribution).starts_with(&format!("{:x} 2|held.txt|", t)));

    f.clear_flags(dir_flags::DIR_STOPPED);
    let report = f.check.scan_dir(common::DirIdx(0), t + 1).unwrap();
    assert_eq!(report.accepted, vec!["held.txt"]);
    assert!(!paused.join("held.txt").exists());
    assert_eq!(f.log(LogKind::Input).lines().count(), 1);
}

#[test]
fn test_error_state_round_trip() {
    let mut f = Fixture::new(&basic("max_errors: 1", "\"*\""));
    let t = now();
    fs::remove_dir(&f.src).unwrap();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    assert_eq!(report.errors, 1);
    assert!(f.row().has(dir_flags::ERROR_SET));
    assert_eq!(f.row().status, common::DirStatus::Error);

    fs::create_dir(&f.src).unwrap();
    f.check.scan_dir(common::DirIdx(0), t + 1).unwrap();
    let row = f.row();
    assert!(!row.has(dir_flags::ERROR_SET));
    assert_eq!(row.error_counter, 0);
    assert_eq!(row.status, common::DirStatus::Normal);
    let events = f.log(LogKind::Event);
    assert!(events.contains(" D|E|1|A|1 errors"));
    assert!(events.contains(" D|E|2|A"));
}

#[test]
fn test_failed_exec_keeps_job_in_store() {
    let doc = r#"
directories:
  - location: SRC
    alias: A
    file_groups:
      - masks: ["*"]
        destinations:
          - recipients: ["file:///tmp/o1"]
            options: ["exec exit 3"]
"#;
    let mut f = Fixture::new(doc);
    f.put("a.txt", b"abc");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Failed);
    assert!(job.dir.starts_with(f.paths.store_dir(f.dir_id())));
    assert!(job.dir.join("a.txt").exists());
    assert!(f.log(LogKind::Production).contains("|3|exec exit 3\n"));
    assert!(f.log(LogKind::Delete).starts_with(&format!("{:x} localhost 10|a.txt|3|", t)));
}

#[test]
fn test_closed_time_window_holds_job() {
    let minute = {
        let t = Local::now();
        t.hour() * 60 + t.minute()
    };
    let (start, end) = ((minute + 2) % 1440, (minute + 3) % 1440);
    let doc = format!(
        r#"
directories:
  - location: SRC
    alias: A
    file_groups:
      - masks: ["*"]
        destinations:
          - recipients: ["file:///tmp/o1"]
            options: ["time-filter {:02}:{:02}-{:02}:{:02}", "priority 3"]
"#,
        start / 60,
        start % 60,
        end / 60,
        end % 60
    );
    let mut f = Fixture::new(&doc);
    f.put("late.txt", b"zzz");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::Held);
    assert!(job.dir.starts_with(WorkPaths::time_dir(&f.files_root())));
    assert_eq!(fs::read_to_string(job.dir.join(".options")).unwrap(), "priority 3\n");
    assert!(f.log(LogKind::Distribution).starts_with(&format!("{:x} 1|late.txt|", t)));
}

#[test]
fn test_failed_staging_forgets_fingerprint() {
    let mut f = Fixture::new(&basic("dup_check: { timeout: 60, action: delete }", "\"*\""));
    let tmp = WorkPaths::tmp_dir(&f.files_root());
    let _ = fs::remove_dir_all(&tmp);
    fs::write(&tmp, b"").unwrap();
    f.put("a.bin", b"same");
    let t = now();
    assert!(f.check.scan_dir(common::DirIdx(0), t).is_err());
    assert!(f.src.join("a.bin").exists());

    fs::remove_file(&tmp).unwrap();
    fs::create_dir(&tmp).unwrap();
    let retry = f.check.scan_dir(common::DirIdx(0), t + 1).unwrap();
    assert_eq!(retry.accepted, vec!["a.bin"]);
    assert_eq!(retry.jobs.len(), 1);
    assert_eq!(f.log(LogKind::Delete), "");
}

#[test]
fn test_unbuildable_job_is_stored_and_logged() {
    let mut f = Fixture::new(&basic("", "\"*\""));
    let (dir_id, job) = (f.dir_id(), f.job_id(0));
    let outgoing = WorkPaths::outgoing_dir(&f.files_root());
    fs::create_dir_all(&outgoing).unwrap();
    fs::write(outgoing.join(format!("{:x}", job)), b"").unwrap();
    f.put("hello.txt", b"hello");
    let t = now();
    let report = f.check.scan_dir(common::DirIdx(0), t).unwrap();

    assert_eq!(report.accepted, vec!["hello.txt"]);
    let stored = &report.jobs[0];
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(fs::read(stored.dir.join("hello.txt")).unwrap(), b"hello");
    assert!(stored.dir.starts_with(f.paths.store_dir(dir_id)));
    assert_eq!(f.tmp_entries(), 0);

    assert_eq!(f.log(LogKind::Input).lines().count(), 1);
    assert!(f.log(LogKind::Distribution).starts_with(&format!("{:x} 0|hello.txt|", t)));
    assert_eq!(
        f.log(LogKind::Delete),
        format!(
            "{:x} localhost 16|hello.txt|5|{:x}|{:x}|{}|dir_check\n",
            t, job, dir_id, stored.key
        )
    );
}
