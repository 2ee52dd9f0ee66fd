//! Local options run on a recipient's job directory before handoff.
//!
//! Every file an option produces is recorded in the production log under
//! the job key of that recipient.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use common::logs::{ProductionRecord, ProductionTiming};
use common::mask::FileMask;
use common::rules::{JobOption, LocalOption};
use common::JobKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub size: u64,
}

/// A command that exited non-zero; the job is not handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    pub command: String,
    pub return_code: i32,
    pub output: String,
}

#[derive(Debug, Default)]
pub struct Production {
    pub records: Vec<ProductionRecord>,
    pub files: Vec<StagedFile>,
    pub failure: Option<ExecFailure>,
}

pub struct Producer<'a> {
    pub job_dir: &'a Path,
    pub key: JobKey,
    pub dir_id: u32,
    pub job_id: u32,
    pub now: i64,
}

impl Producer<'_> {
    pub fn run<'o>(&self, options: impl IntoIterator<Item = &'o LocalOption>, files: Vec<StagedFile>) -> io::Result<Production> {
        let mut production = Production {
            files,
            ..Production::default()
        };
        for option in options {
            match option {
                LocalOption::TimeFilter { .. } => continue,
                LocalOption::Exec { command } => {
                    self.exec(command, &mut production)?;
                    if production.failure.is_some() {
                        break;
                    }
                }
                other => self.rename_all(other, &mut production)?,
            }
        }
        Ok(production)
    }

    fn record(&self, ratio: (u32, u32), timing: ProductionTiming, from: &StagedFile, to: &StagedFile, rc: i32, command: String) -> ProductionRecord {
        ProductionRecord {
            time: self.now,
            ratio,
            timing: Some(timing),
            key: self.key,
            dir_id: self.dir_id,
            job_id: self.job_id,
            original_name: from.name.clone(),
            original_size: Some(from.size),
            new_name: to.name.clone(),
            new_size: to.size,
            return_code: rc,
            command,
        }
    }

    fn rename_all(&self, option: &LocalOption, production: &mut Production) -> io::Result<()> {
        let command = JobOption::Local(option.clone()).to_string();
        let mut renamed = Vec::with_capacity(production.files.len());
        for file in production.files.drain(..) {
            let new_name = match new_name(option, &file.name, &self.key) {
                Some(n) if n != file.name && !n.is_empty() && !n.contains('/') => n,
                _ => {
                    renamed.push(file);
                    continue;
                }
            };
            fs::rename(self.job_dir.join(&file.name), self.job_dir.join(&new_name))?;
            let to = StagedFile {
                name: new_name,
                size: file.size,
            };
            production
                .records
                .push(self.record((1, 1), ProductionTiming::default(), &file, &to, 0, command.clone()));
            renamed.push(to);
        }
        production.files = renamed;
        Ok(())
    }

    fn exec(&self, command: &str, production: &mut Production) -> io::Result<()> {
        let mut remaining = Vec::new();
        let files = std::mem::take(&mut production.files);
        for (pos, file) in files.iter().enumerate() {
            let before = listing(self.job_dir)?;
            let line = command.replace("%s", &file.name);
            let cpu_before = children_cpu();
            let started = Instant::now();
            let output = Command::new("sh")
                .arg("-c")
                .arg(&line)
                .current_dir(self.job_dir)
                .output()?;
            let (cpu_sec, cpu_usec) = cpu_delta(cpu_before, children_cpu());
            let timing = ProductionTiming {
                duration: started.elapsed().as_secs(),
                cpu_sec,
                cpu_usec,
            };
            let rc = output.status.code().unwrap_or(-1);
            let text = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if rc != 0 {
                production
                    .records
                    .push(self.record((1, 0), timing, file, file, rc, format!("exec {}", command)));
                production.failure = Some(ExecFailure {
                    command: line,
                    return_code: rc,
                    output: text,
                });
                remaining.extend(files[pos..].iter().cloned());
                production.files = remaining;
                return Ok(());
            }
            if !text.trim().is_empty() {
                log::debug!("{}: {}", line, text.trim());
            }

            let after = listing(self.job_dir)?;
            let mut produced: Vec<StagedFile> = after
                .difference(&before)
                .map(|name| staged(self.job_dir, name))
                .collect::<io::Result<_>>()?;
            if after.contains(&file.name) {
                produced.insert(0, staged(self.job_dir, &file.name)?);
            }
            let ratio = (1, produced.len() as u32);
            for out in &produced {
                production
                    .records
                    .push(self.record(ratio, timing, file, out, 0, format!("exec {}", command)));
            }
            remaining.extend(produced);
        }
        production.files = remaining;
        Ok(())
    }
}

fn staged(dir: &Path, name: &str) -> io::Result<StagedFile> {
    Ok(StagedFile {
        name: name.to_string(),
        size: fs::metadata(dir.join(name))?.len(),
    })
}

fn listing(dir: &Path) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            if !name.starts_with('.') && entry.file_type()?.is_file() {
                names.insert(name);
            }
        }
    }
    Ok(names)
}

/// CPU time (user + system) of waited-for children, in microseconds.
fn children_cpu() -> u64 {
    // SAFETY: rusage is plain data filled in by the kernel.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: valid pointer to a zeroed rusage.
    if unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) } != 0 {
        return 0;
    }
    let micros = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    micros(usage.ru_utime) + micros(usage.ru_stime)
}

fn cpu_delta(before: u64, after: u64) -> (u64, u64) {
    let used = after.saturating_sub(before);
    (used / 1_000_000, used % 1_000_000)
}

/// Spans matched by each `*` of `pattern`, or `None` on a mismatch.
fn captures<'n>(pattern: &[u8], name: &'n str) -> Option<Vec<&'n str>> {
    fn walk<'n>(p: &[u8], name: &'n str, pos: usize, out: &mut Vec<&'n str>) -> bool {
        let rest = &name.as_bytes()[pos..];
        match p.first() {
            None => rest.is_empty(),
            Some(b'*') => {
                for end in (pos..=name.len()).rev() {
                    if !name.is_char_boundary(end) {
                        continue;
                    }
                    out.push(&name[pos..end]);
                    if walk(&p[1..], name, end, out) {
                        return true;
                    }
                    out.pop();
                }
                false
            }
            Some(b'?') => {
                let Some(c) = name[pos..].chars().next() else {
                    return false;
                };
                walk(&p[1..], name, pos + c.len_utf8(), out)
            }
            Some(&b) => rest.first() == Some(&b) && walk(&p[1..], name, pos + 1, out),
        }
    }
    let mut out = Vec::new();
    walk(pattern, name, 0, &mut out).then_some(out)
}

/// `*` takes the next captured span, `%t`/`%n` the batch time and unique
/// number in hex.
fn expand(to: &str, caps: &[&str], key: &JobKey) -> String {
    let mut out = String::new();
    let mut caps = caps.iter();
    let mut chars = to.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(caps.next().copied().unwrap_or("")),
            '%' => match chars.peek() {
                Some('t') => {
                    chars.next();
                    out.push_str(&format!("{:x}", key.creation_time));
                }
                Some('n') => {
                    chars.next();
                    out.push_str(&format!("{:x}", key.unique_number));
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            other => out.push(other),
        }
    }
    out
}

fn rename_target(from: &FileMask, to: &str, name: &str, key: &JobKey) -> Option<String> {
    if from.is_negated() || !from.matches(name) {
        return None;
    }
    let caps = captures(from.to_string().as_bytes(), name).unwrap_or_else(|| vec![name]);
    Some(expand(to, &caps, key))
}

/// Name after a renaming option, `None` when the option leaves it alone.
pub fn new_name(option: &LocalOption, name: &str, key: &JobKey) -> Option<String> {
    match option {
        LocalOption::Rename { from, to } => rename_target(from, to, name, key),
        LocalOption::Prefix { add: true, text } => Some(format!("{}{}", text, name)),
        LocalOption::Prefix { add: false, text } => name.strip_prefix(text.as_str()).map(str::to_string),
        LocalOption::Suffix { add: true, text } => Some(format!("{}{}", name, text)),
        LocalOption::Suffix { add: false, text } => name.strip_suffix(text.as_str()).map(str::to_string),
        LocalOption::ToUpper => Some(name.to_uppercase()),
        LocalOption::ToLower => Some(name.to_lowercase()),
        LocalOption::Exec { .. } | LocalOption::TimeFilter { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(text: &str) -> LocalOption {
        match text.parse::<JobOption>().unwrap() {
            JobOption::Local(option) => option,
            JobOption::Standard(_) => panic!("{} is not local", text),
        }
    }

    #[test]
    fn test_rename_patterns() {
        let key = JobKey::new(0xf0, 3, 0);
        assert_eq!(
            new_name(&local("rename *.txt %t_*.dat"), "hello.txt", &key).as_deref(),
            Some("f0_hello.dat")
        );
        assert_eq!(
            new_name(&local("rename a*_*.csv *-*-%n.csv"), "ab_cd.csv", &key).as_deref(),
            Some("b-cd-3.csv")
        );
        assert_eq!(new_name(&local("rename *.txt *.dat"), "x.csv", &key), None);
        assert_eq!(new_name(&local("prefix del X_"), "X_a", &key).as_deref(), Some("a"));
        assert_eq!(new_name(&local("prefix del X_"), "a", &key), None);
        assert_eq!(new_name(&local("suffix add .gz"), "a", &key).as_deref(), Some("a.gz"));
        assert_eq!(new_name(&local("toupper"), "a.b", &key).as_deref(), Some("A.B"));
    }

    fn producer(dir: &Path) -> Producer<'_> {
        Producer {
            job_dir: dir,
            key: JobKey::new(0xf0, 3, 1),
            dir_id: 0x1f,
            job_id: 0xabc,
            now: 0x100,
        }
    }

    #[test]
    fn test_rename_records_production() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let options = [local("rename *.txt *.dat"), local("toupper")];
        let files = vec![StagedFile { name: "a.txt".into(), size: 5 }];
        let production = producer(dir.path()).run(options.iter(), files).unwrap();

        assert!(production.failure.is_none());
        assert_eq!(production.files, vec![StagedFile { name: "A.DAT".into(), size: 5 }]);
        assert!(dir.path().join("A.DAT").exists());
        let lines: Vec<String> = production.records.iter().map(|r| r.format(b'|')).collect();
        assert_eq!(
            lines,
            vec![
                "100:1:1|0.0.0|f0_3_1|1f|abc|a.txt|5|a.dat|5|0|rename *.txt *.dat\n",
                "100:1:1|0.0.0|f0_3_1|1f|abc|a.dat|5|A.DAT|5|0|toupper\n",
            ]
        );
    }

    #[test]
    fn test_exec_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        let files = vec![StagedFile { name: "a".into(), size: 5 }];
        let split = [local("exec cp %s %s.copy")];
        let production = producer(dir.path()).run(split.iter(), files).unwrap();
        assert!(production.failure.is_none());
        let names: Vec<&str> = production.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a.copy"]);
        assert!(production.records.iter().all(|r| r.ratio == (1, 2)));

        let failing = [local("exec echo broken; exit 4"), local("toupper")];
        let files = vec![StagedFile { name: "a".into(), size: 5 }];
        let production = producer(dir.path()).run(failing.iter(), files).unwrap();
        let failure = production.failure.unwrap();
        assert_eq!(failure.return_code, 4);
        assert!(failure.output.contains("broken"));
        assert_eq!(production.records.len(), 1);
        assert_eq!(production.records[0].return_code, 4);
        assert!(dir.path().join("a").exists());
    }
}
