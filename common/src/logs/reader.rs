//! Reading the lineage logs: whole-segment iteration for searches and a
//! rotation-aware follower for continuous mode.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::writer::log_path;
use super::{record_time, LogKind};
use crate::error::{IoContext, Result};

/// One generation of a log (`<BASE>.<number>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub kind: LogKind,
    pub number: u32,
    pub path: PathBuf,
    pub inode: u64,
    pub size: u64,
    pub first_time: Option<i64>,
    pub last_time: Option<i64>,
}

impl LogSegment {
    pub fn open(dir: &Path, kind: LogKind, number: u32) -> Result<Option<Self>> {
        let path = log_path(dir, kind, number);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_io_context(|| format!("stat {}", path.display())),
        };
        let mut file = File::open(&path).with_io_context(|| format!("open {}", path.display()))?;
        let first_time = first_record_time(&mut file)
            .with_io_context(|| format!("read {}", path.display()))?;
        let last_time = last_record_time(&mut file, meta.len())
            .with_io_context(|| format!("read {}", path.display()))?;
        Ok(Some(Self {
            kind,
            number,
            path,
            inode: meta.ino(),
            size: meta.len(),
            first_time,
            last_time,
        }))
    }

    /// All generations present on disk, oldest first.
    pub fn list(dir: &Path, kind: LogKind) -> Result<Vec<Self>> {
        let prefix = format!("{}.", kind.base_name());
        let mut numbers = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_io_context(|| format!("read {}", dir.display())),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(n) = name.strip_prefix(&prefix).and_then(|n| n.parse::<u32>().ok()) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut segments = Vec::with_capacity(numbers.len());
        for n in numbers {
            if let Some(segment) = Self::open(dir, kind, n)? {
                segments.push(segment);
            }
        }
        Ok(segments)
    }

    /// Whether any record of this segment can fall inside `[start, end]`.
    /// Empty segments never overlap.
    pub fn overlaps(&self, start: Option<i64>, end: Option<i64>) -> bool {
        let (Some(first), Some(last)) = (self.first_time, self.last_time) else {
            return false;
        };
        start.map_or(true, |s| last >= s) && end.map_or(true, |e| first <= e)
    }

    pub fn lines(&self) -> Result<SegmentLines> {
        self.lines_from(0)
    }

    /// Iterates complete lines starting at byte `offset`.
    pub fn lines_from(&self, offset: u64) -> Result<SegmentLines> {
        let mut file =
            File::open(&self.path).with_io_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .with_io_context(|| format!("seek {}", self.path.display()))?;
        Ok(SegmentLines {
            reader: BufReader::new(file),
            offset,
            buf: Vec::new(),
        })
    }
}

/// A line of a log together with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub offset: u64,
    pub text: String,
}

pub struct SegmentLines {
    reader: BufReader<File>,
    offset: u64,
    buf: Vec<u8>,
}

impl SegmentLines {
    /// Byte offset just past the last complete line returned.
    pub fn position(&self) -> u64 {
        self.offset
    }
}

impl Iterator for SegmentLines {
    type Item = io::Result<LogLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(n) => {
                // An unterminated tail is a record still being written.
                if self.buf.last() != Some(&b'\n') {
                    return None;
                }
                let line = LogLine {
                    offset: self.offset,
                    text: String::from_utf8_lossy(&self.buf).into_owned(),
                };
                self.offset += n as u64;
                Some(Ok(line))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

fn first_record_time(file: &mut File) -> io::Result<Option<i64>> {
    file.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; 64];
    let n = file.read(&mut head)?;
    Ok(record_time(&String::from_utf8_lossy(&head[..n])))
}

fn last_record_time(file: &mut File, len: u64) -> io::Result<Option<i64>> {
    if len == 0 {
        return Ok(None);
    }
    let mut window = 4096u64.min(len);
    loop {
        file.seek(SeekFrom::Start(len - window))?;
        let mut tail = vec![0u8; window as usize];
        file.read_exact(&mut tail)?;
        // Ignore an unterminated record still being written.
        if let Some(end) = tail.iter().rposition(|&b| b == b'\n') {
            let body = &tail[..end];
            if let Some(pos) = body.iter().rposition(|&b| b == b'\n') {
                return Ok(record_time(&String::from_utf8_lossy(&body[pos + 1..])));
            }
            if window == len {
                return Ok(record_time(&String::from_utf8_lossy(body)));
            }
        } else if window == len {
            return Ok(None);
        }
        window = (window * 2).min(len);
    }
}

/// Tails `<BASE>.0`, following it across rotations.
///
/// Partial lines are held back until their newline arrives. When the name
/// points at a new inode the old file is drained first, then the new one is
/// read from the start, so each record is produced exactly once.
pub struct LogFollower {
    path: PathBuf,
    file: File,
    ino: u64,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    cancel: Arc<AtomicBool>,
    poll: Duration,
}

impl LogFollower {
    /// `from` is the byte offset to start at; `None` starts at the end.
    pub fn open(dir: &Path, kind: LogKind, from: Option<u64>) -> Result<Self> {
        let path = log_path(dir, kind, 0);
        let (mut file, ino) = wait_for_file(&path, None)?;
        let start = match from {
            Some(offset) => SeekFrom::Start(offset),
            None => SeekFrom::End(0),
        };
        file.seek(start)
            .with_io_context(|| format!("seek {}", path.display()))?;
        Ok(Self {
            path,
            file,
            ino,
            partial: Vec::new(),
            ready: VecDeque::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            poll: Duration::from_millis(500),
        })
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Collects every complete line available right now without blocking.
    pub fn poll_lines(&mut self) -> Result<Vec<String>> {
        self.drain_current()?;
        match fs::metadata(&self.path) {
            Ok(meta) if meta.ino() != self.ino => {
                // Rotated: anything appended to the old inode before the
                // rename has been drained above.
                if !self.partial.is_empty() {
                    log::debug!(
                        "Dropping {} unterminated bytes at rotation of {}",
                        self.partial.len(),
                        self.path.display()
                    );
                    self.partial.clear();
                }
                let (file, ino) = wait_for_file(&self.path, Some(&self.cancel))?;
                self.file = file;
                self.ino = ino;
                self.drain_current()?;
            }
            _ => {}
        }
        Ok(self.ready.drain(..).collect())
    }

    fn drain_current(&mut self) -> Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = self
                .file
                .read(&mut chunk)
                .with_io_context(|| format!("read {}", self.path.display()))?;
            if n == 0 {
                break;
            }
            self.partial.extend_from_slice(&chunk[..n]);
        }
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.ready.push_back(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(())
    }
}

impl Iterator for LogFollower {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.cancel.load(Ordering::Relaxed) {
                return None;
            }
            match self.poll_lines() {
                Ok(lines) => self.ready.extend(lines),
                Err(e) => return Some(Err(e)),
            }
            if self.ready.is_empty() {
                thread::sleep(self.poll);
            }
        }
    }
}

/// Opens `path`, waiting while a rotation has it momentarily missing.
fn wait_for_file(path: &Path, cancel: Option<&Arc<AtomicBool>>) -> Result<(File, u64)> {
    loop {
        match File::open(path) {
            Ok(file) => {
                let ino = file
                    .metadata()
                    .with_io_context(|| format!("stat {}", path.display()))?
                    .ino();
                return Ok((file, ino));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                    return Err(e).with_io_context(|| format!("open {}", path.display()));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e).with_io_context(|| format!("open {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::writer::{LogPolicy, LogWriter};

    fn write(dir: &Path, number: u32, text: &str) {
        fs::write(log_path(dir, LogKind::Input, number), text).unwrap();
    }

    #[test]
    fn test_segments_oldest_first_with_time_range() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 0, "30 c|1|1|1\n40 d|1|1|1\n");
        write(dir.path(), 1, "10 a|1|1|1\n20 b|1|1|1\n");
        let segments = LogSegment::list(dir.path(), LogKind::Input).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].number, 1);
        assert_eq!(segments[0].first_time, Some(0x10));
        assert_eq!(segments[0].last_time, Some(0x20));
        assert!(segments[1].overlaps(Some(0x35), None));
        assert!(!segments[0].overlaps(Some(0x21), Some(0x50)));
    }

    #[test]
    fn test_lines_skip_unterminated_tail() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 0, "10 a|1|1|1\n20 b|1|1|1\n30 c|1");
        let segment = LogSegment::open(dir.path(), LogKind::Input, 0).unwrap().unwrap();
        let lines: Vec<LogLine> = segment.lines().unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].offset, 11);
        let resumed: Vec<LogLine> = segment.lines_from(11).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(resumed[0].text, "20 b|1|1|1\n");
        assert_eq!(segment.last_time, Some(0x20));
    }

    #[test]
    fn test_follower_survives_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogPolicy {
            max_size: 0,
            retention: 3,
        };
        let mut writer = LogWriter::open(dir.path(), LogKind::Input, policy).unwrap();
        writer.append("10 a|1|1|1\n").unwrap();
        let mut follower = LogFollower::open(dir.path(), LogKind::Input, Some(0)).unwrap();
        assert_eq!(follower.poll_lines().unwrap(), vec!["10 a|1|1|1\n".to_string()]);

        writer.append("20 b|1|1|1\n").unwrap();
        writer.rotate().unwrap();
        writer.append("30 c|1|1|1\n").unwrap();

        let lines = follower.poll_lines().unwrap();
        assert_eq!(lines, vec!["20 b|1|1|1\n".to_string(), "30 c|1|1|1\n".to_string()]);
        assert!(follower.poll_lines().unwrap().is_empty());
    }

    #[test]
    fn test_follower_holds_partial_line_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), 0, "");
        let mut follower = LogFollower::open(dir.path(), LogKind::Input, None)
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let path = log_path(dir.path(), LogKind::Input, 0);
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, b"10 a|1").unwrap();
        assert!(follower.poll_lines().unwrap().is_empty());
        std::io::Write::write_all(&mut f, b"|1|1\n").unwrap();
        assert_eq!(follower.poll_lines().unwrap(), vec!["10 a|1|1|1\n".to_string()]);

        follower.cancel_handle().store(true, Ordering::Relaxed);
        assert!(follower.next().is_none());
    }
}
