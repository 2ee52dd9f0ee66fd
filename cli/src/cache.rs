//! Per-inode memory of log lines already read in this session.
//!
//! For every line seen the cache keeps its offset and record time, so a
//! later search can seek straight to the first line of its time window.
//! Lines that were already reported carry the gotcha bit and are skipped
//! when the same file is searched again (continuous mode).

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use common::logs::{record_time, LogLine, LogSegment};

/// Writers on several processes append concurrently, so records may be
/// this many seconds out of time order.
pub const ORDER_SLACK: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct IndexedLine {
    offset: u64,
    time: i64,
}

#[derive(Debug, Default)]
struct FileIndex {
    lines: Vec<IndexedLine>,
    /// Offset just past the last indexed line.
    end: u64,
    gotcha: HashSet<u64>,
}

/// Outcome of visiting one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
pub struct PositionCache {
    files: HashMap<u64, FileIndex>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_gotcha(&self, inode: u64, offset: u64) -> bool {
        self.files.get(&inode).map_or(false, |f| f.gotcha.contains(&offset))
    }

    pub fn mark_gotcha(&mut self, inode: u64, offset: u64) {
        self.files.entry(inode).or_default().gotcha.insert(offset);
    }

    pub fn indexed_lines(&self, inode: u64) -> usize {
        self.files.get(&inode).map_or(0, |f| f.lines.len())
    }

    /// Offset of the first line that may be at or after `from`.
    fn start_offset(index: &FileIndex, from: Option<i64>) -> u64 {
        let Some(from) = from else { return 0 };
        let floor = from.saturating_sub(ORDER_SLACK);
        match index.lines.iter().position(|l| l.time >= floor) {
            Some(i) => index.lines[i].offset,
            None => index.end,
        }
    }

    /// Visits the lines of `segment` whose time may fall in `[from, to]`,
    /// skipping gotcha lines. Lines past `to` (plus slack) end the scan.
    /// Returns false when `keep_going` asked to stop early.
    pub fn scan(
        &mut self,
        segment: &LogSegment,
        from: Option<i64>,
        to: Option<i64>,
        mut keep_going: impl FnMut() -> bool,
        mut visit: impl FnMut(&LogLine) -> Result<Flow>,
    ) -> Result<bool> {
        let index = self.files.entry(segment.inode).or_default();
        if segment.size < index.end {
            // Truncated or the inode was reused.
            *index = FileIndex::default();
        }
        let start = Self::start_offset(index, from);
        let mut lines = segment.lines_from(start)?;
        while let Some(line) = lines.next() {
            let line = line?;
            let time = record_time(&line.text).unwrap_or(i64::MIN);
            if line.offset >= index.end {
                index.lines.push(IndexedLine {
                    offset: line.offset,
                    time,
                });
                index.end = lines.position();
            }
            if !keep_going() {
                return Ok(false);
            }
            if to.map_or(false, |to| time > to.saturating_add(ORDER_SLACK)) {
                break;
            }
            if index.gotcha.contains(&line.offset) {
                continue;
            }
            if visit(&line)? == Flow::Stop {
                break;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::logs::LogKind;
    use std::fs;

    fn segment(dir: &std::path::Path, text: &str) -> LogSegment {
        fs::write(dir.join("INPUT_LOG.0"), text).unwrap();
        LogSegment::open(dir, LogKind::Input, 0).unwrap().unwrap()
    }

    fn collect(cache: &mut PositionCache, seg: &LogSegment, from: Option<i64>, to: Option<i64>) -> Vec<String> {
        let mut seen = Vec::new();
        cache
            .scan(seg, from, to, || true, |line| {
                seen.push(line.text.trim_end().to_string());
                Ok(Flow::Continue)
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_index_seeks_to_window() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (0..10).map(|i| format!("{:x} f{}|1|1|{:x}\n", 1000 + i * 100, i, i)).collect();
        let seg = segment(dir.path(), &text);
        let mut cache = PositionCache::new();
        assert_eq!(collect(&mut cache, &seg, None, None).len(), 10);
        assert_eq!(cache.indexed_lines(seg.inode), 10);

        // f4 is at 1400, f5 at 1500; the slack reaches back to 1450.
        let window = collect(&mut cache, &seg, Some(1510), Some(1600));
        assert_eq!(window, vec!["5dc f5|1|1|5", "640 f6|1|1|6"]);
    }

    #[test]
    fn test_gotcha_lines_are_skipped_and_growth_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let seg = segment(dir.path(), "10 a|1|1|1\n20 b|1|1|2\n");
        let mut cache = PositionCache::new();
        cache.mark_gotcha(seg.inode, 0);
        assert_eq!(collect(&mut cache, &seg, None, None), vec!["20 b|1|1|2"]);

        let mut f = fs::OpenOptions::new().append(true).open(&seg.path).unwrap();
        std::io::Write::write_all(&mut f, b"30 c|1|1|3\n").unwrap();
        let grown = LogSegment::open(dir.path(), LogKind::Input, 0).unwrap().unwrap();
        assert_eq!(
            collect(&mut cache, &grown, Some(0x30), None),
            vec!["20 b|1|1|2", "30 c|1|1|3"]
        );
        assert_eq!(cache.indexed_lines(seg.inode), 3);
    }

    #[test]
    fn test_keep_going_stops_scan() {
        let dir = tempfile::tempdir().unwrap();
        let seg = segment(dir.path(), "10 a|1|1|1\n20 b|1|1|2\n");
        let mut cache = PositionCache::new();
        let mut budget = 1;
        let finished = cache
            .scan(&seg, None, None, || {
                budget -= 1;
                budget >= 0
            }, |_| Ok(Flow::Continue))
            .unwrap();
        assert!(!finished);
    }
}
