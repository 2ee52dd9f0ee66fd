use std::fmt;

use super::{parse_hex_u32, parse_hex_u64, sep_char, split_time};
use crate::error::{AfdError, Result};

const LOG: &str = "distribution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionType {
    Normal = 0,
    TimeJob = 1,
    QueueStopped = 2,
    Disabled = 3,
    AgeLimitDelete = 4,
    DupCheckDelete = 5,
    DupCheckStore = 6,
}

impl DistributionType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DistributionType::Normal,
            1 => DistributionType::TimeJob,
            2 => DistributionType::QueueStopped,
            3 => DistributionType::Disabled,
            4 => DistributionType::AgeLimitDelete,
            5 => DistributionType::DupCheckDelete,
            6 => DistributionType::DupCheckStore,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            DistributionType::Normal => "normal",
            DistributionType::TimeJob => "time job",
            DistributionType::QueueStopped => "queue stopped",
            DistributionType::Disabled => "disabled",
            DistributionType::AgeLimitDelete => "age limit delete",
            DistributionType::DupCheckDelete => "dupcheck delete",
            DistributionType::DupCheckStore => "dupcheck store",
        }
    }
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// `<hex-time> <type>[-<count>] SEP <filename> SEP <hex-input-time> SEP
/// <hex-dir-id> SEP <hex-unique> SEP <hex-size> SEP <job_id>_<cycles>[,…]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
    pub time: i64,
    pub dis_type: DistributionType,
    pub filename: String,
    pub input_time: i64,
    pub dir_id: u32,
    pub unique_number: u32,
    pub size: u64,
    /// `(job_id, processing_cycles)` pairs this batch feeds.
    pub jobs: Vec<(u32, u32)>,
}

impl DistributionRecord {
    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        let mut line = format!("{:x} {:x}", self.time, self.dis_type.code());
        if self.jobs.len() > 1 {
            line.push_str(&format!("-{:x}", self.jobs.len()));
        }
        line.push_str(&format!(
            "{s}{}{s}{:x}{s}{:x}{s}{:x}{s}{:x}{s}",
            self.filename, self.input_time, self.dir_id, self.unique_number, self.size
        ));
        let jobs: Vec<String> = self
            .jobs
            .iter()
            .map(|(job_id, cycles)| format!("{:x}_{:x}", job_id, cycles))
            .collect();
        line.push_str(&jobs.join(","));
        line.push('\n');
        line
    }

    pub fn parse(line: &str, sep: u8) -> Result<Self> {
        let (time, rest) = split_time(line, LOG)?;
        let sc = sep_char(sep);
        let (type_field, rest) = rest
            .split_once(sc)
            .ok_or_else(|| AfdError::integrity(LOG, "missing type field"))?;
        let (type_code, count) = match type_field.split_once('-') {
            Some((t, c)) => (t, Some(parse_hex_u32(c, LOG, "job count")?)),
            None => (type_field, None),
        };
        let code = u8::from_str_radix(type_code, 16)
            .map_err(|_| AfdError::integrity(LOG, format!("bad type '{}'", type_code)))?;
        let dis_type = DistributionType::from_code(code)
            .ok_or_else(|| AfdError::integrity(LOG, format!("unknown type {}", code)))?;

        let mut fields = rest.rsplitn(6, sc);
        let (Some(jobs), Some(size), Some(unique), Some(dir_id), Some(input_time), Some(filename)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(AfdError::integrity(LOG, format!("too few fields in '{}'", rest)));
        };

        let mut job_list = Vec::new();
        for entry in jobs.split(',').filter(|e| !e.is_empty()) {
            let (job_id, cycles) = entry
                .split_once('_')
                .ok_or_else(|| AfdError::integrity(LOG, format!("bad job entry '{}'", entry)))?;
            job_list.push((
                parse_hex_u32(job_id, LOG, "job id")?,
                parse_hex_u32(cycles, LOG, "cycles")?,
            ));
        }
        if let Some(count) = count {
            if count as usize != job_list.len() {
                log::debug!(
                    "Distribution record announces {} jobs but lists {}",
                    count,
                    job_list.len()
                );
            }
        }

        Ok(DistributionRecord {
            time,
            dis_type,
            filename: filename.to_string(),
            input_time: parse_hex_u64(input_time, LOG, "input time")? as i64,
            dir_id: parse_hex_u32(dir_id, LOG, "directory id")?,
            unique_number: parse_hex_u32(unique, LOG, "unique number")?,
            size: parse_hex_u64(size, LOG, "size")?,
            jobs: job_list,
        })
    }

    pub fn feeds_job(&self, job_id: u32) -> bool {
        self.jobs.iter().any(|(id, _)| *id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(jobs: Vec<(u32, u32)>) -> DistributionRecord {
        DistributionRecord {
            time: 0x6520_1a2c,
            dis_type: DistributionType::Normal,
            filename: "hello.txt".to_string(),
            input_time: 0x6520_1a2b,
            dir_id: 0x1f,
            unique_number: 3,
            size: 5,
            jobs,
        }
    }

    #[test]
    fn test_single_job_has_no_count() {
        let rec = sample(vec![(0xabc, 0)]);
        assert_eq!(rec.format(b'|'), "65201a2c 0|hello.txt|65201a2b|1f|3|5|abc_0\n");
        assert_eq!(DistributionRecord::parse(&rec.format(b'|'), b'|').unwrap(), rec);
    }

    #[test]
    fn test_multiple_jobs_have_count() {
        let mut rec = sample(vec![(0xabc, 0), (0xdef, 2)]);
        rec.dis_type = DistributionType::Disabled;
        let line = rec.format(b'|');
        assert_eq!(line, "65201a2c 3-2|hello.txt|65201a2b|1f|3|5|abc_0,def_2\n");
        let parsed = DistributionRecord::parse(&line, b'|').unwrap();
        assert!(parsed.feeds_job(0xdef));
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(DistributionRecord::parse("1 9|a|1|1|1|1|1_0\n", b'|').is_err());
    }

    #[test]
    fn test_alternate_separator() {
        let rec = sample(vec![(1, 1)]);
        let line = rec.format(b';');
        assert!(line.contains(";hello.txt;"));
        assert_eq!(DistributionRecord::parse(&line, b';').unwrap(), rec);
    }
}
