use super::{parse_hex_u32, parse_hex_u64, sep_char};
use crate::error::{AfdError, Result};
use crate::job::JobKey;

const LOG: &str = "production";

/// Wall time and CPU time spent producing the new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProductionTiming {
    pub duration: u64,
    pub cpu_sec: u64,
    pub cpu_usec: u64,
}

/// `<hex-time>:<hex-ratio1>:<hex-ratio2> SEP [<dur>.<cpu-sec>.<cpu-usec> SEP]
/// <key> SEP <hex-dir-id> SEP <hex-job-id> SEP <original-name> SEP
/// [<hex-orig-size> SEP]<new-name> SEP <hex-new-size> SEP <return-code> SEP <command>`
///
/// Records written by older producers carry neither timing nor original
/// size; both are `None` after parsing such a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRecord {
    pub time: i64,
    /// Input files : output files of this production step.
    pub ratio: (u32, u32),
    pub timing: Option<ProductionTiming>,
    pub key: JobKey,
    pub dir_id: u32,
    pub job_id: u32,
    pub original_name: String,
    pub original_size: Option<u64>,
    pub new_name: String,
    pub new_size: u64,
    pub return_code: i32,
    pub command: String,
}

impl ProductionRecord {
    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        let mut line = format!("{:x}:{:x}:{:x}{s}", self.time, self.ratio.0, self.ratio.1);
        let new_style = self.timing.is_some() && self.original_size.is_some();
        if new_style {
            let timing = self.timing.unwrap_or_default();
            line.push_str(&format!(
                "{:x}.{:x}.{:x}{s}",
                timing.duration, timing.cpu_sec, timing.cpu_usec
            ));
        }
        line.push_str(&format!(
            "{}{s}{:x}{s}{:x}{s}{}{s}",
            self.key, self.dir_id, self.job_id, self.original_name
        ));
        if new_style {
            line.push_str(&format!("{:x}{s}", self.original_size.unwrap_or(0)));
        }
        line.push_str(&format!(
            "{}{s}{:x}{s}{}{s}{}\n",
            self.new_name, self.new_size, self.return_code, self.command
        ));
        line
    }

    pub fn parse(line: &str, sep: u8) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let sc = sep_char(sep);
        let (head, rest) = line
            .split_once(sc)
            .ok_or_else(|| AfdError::integrity(LOG, "missing separator"))?;

        // Head is `<time>:<r1>:<r2>`; very old records have only `<time>`.
        let mut head_parts = head.split(':');
        let time = head_parts
            .next()
            .ok_or_else(|| AfdError::integrity(LOG, "missing time"))?;
        let time = parse_hex_u64(time, LOG, "time")? as i64;
        let ratio = match (head_parts.next(), head_parts.next()) {
            (Some(a), Some(b)) => (parse_hex_u32(a, LOG, "ratio")?, parse_hex_u32(b, LOG, "ratio")?),
            (None, None) => (1, 1),
            _ => return Err(AfdError::integrity(LOG, format!("bad ratio in '{}'", head))),
        };

        let (second, _) = rest
            .split_once(sc)
            .ok_or_else(|| AfdError::integrity(LOG, "too few fields"))?;
        let new_style = is_timing_field(second);
        let fields: Vec<&str> = if new_style {
            rest.splitn(10, sc).collect()
        } else {
            rest.splitn(8, sc).collect()
        };
        let expected = if new_style { 10 } else { 8 };
        if fields.len() != expected {
            return Err(AfdError::integrity(
                LOG,
                format!("expected {} fields, found {}", expected, fields.len()),
            ));
        }

        let mut i = 0;
        let timing = if new_style {
            let mut parts = fields[0].split('.');
            let mut next = |what: &str| -> Result<u64> {
                parse_hex_u64(parts.next().unwrap_or(""), LOG, what)
            };
            let timing = ProductionTiming {
                duration: next("duration")?,
                cpu_sec: next("cpu seconds")?,
                cpu_usec: next("cpu microseconds")?,
            };
            i += 1;
            Some(timing)
        } else {
            None
        };

        let key: JobKey = fields[i]
            .parse()
            .map_err(|e: String| AfdError::integrity(LOG, e))?;
        let dir_id = parse_hex_u32(fields[i + 1], LOG, "directory id")?;
        let job_id = parse_hex_u32(fields[i + 2], LOG, "job id")?;
        let original_name = fields[i + 3].to_string();
        i += 4;
        let original_size = if new_style {
            let size = parse_hex_u64(fields[i], LOG, "original size")?;
            i += 1;
            Some(size)
        } else {
            None
        };
        let new_name = fields[i].to_string();
        let new_size = parse_hex_u64(fields[i + 1], LOG, "new size")?;
        let return_code = fields[i + 2]
            .parse::<i32>()
            .map_err(|_| AfdError::integrity(LOG, format!("bad return code '{}'", fields[i + 2])))?;
        let command = fields[i + 3].to_string();

        Ok(ProductionRecord {
            time,
            ratio,
            timing,
            key,
            dir_id,
            job_id,
            original_name,
            original_size,
            new_name,
            new_size,
            return_code,
            command,
        })
    }
}

/// `<hex>.<hex>.<hex>` marks the newer layout; the older one starts with the
/// `<hex>_<hex>_<hex>` job key directly.
fn is_timing_field(field: &str) -> bool {
    let parts: Vec<&str> = field.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProductionRecord {
        ProductionRecord {
            time: 0x100,
            ratio: (1, 1),
            timing: Some(ProductionTiming {
                duration: 2,
                cpu_sec: 0,
                cpu_usec: 0x1f4,
            }),
            key: JobKey::new(0xf0, 3, 1),
            dir_id: 0x1f,
            job_id: 0xabc,
            original_name: "a.txt".to_string(),
            original_size: Some(5),
            new_name: "a.dat".to_string(),
            new_size: 5,
            return_code: 0,
            command: "rename".to_string(),
        }
    }

    #[test]
    fn test_new_format_byte_exact() {
        let rec = sample();
        let line = rec.format(b'|');
        assert_eq!(line, "100:1:1|2.0.1f4|f0_3_1|1f|abc|a.txt|5|a.dat|5|0|rename\n");
        assert_eq!(ProductionRecord::parse(&line, b'|').unwrap(), rec);
    }

    #[test]
    fn test_old_format_accepted() {
        let rec = ProductionRecord::parse("100:1:2|f0_3_1|1f|abc|a.txt|a.dat|9|-1|exec gzip %s\n", b'|')
            .unwrap();
        assert_eq!(rec.timing, None);
        assert_eq!(rec.original_size, None);
        assert_eq!(rec.ratio, (1, 2));
        assert_eq!(rec.return_code, -1);
        assert_eq!(rec.command, "exec gzip %s");
        // Old style records re-format in the old layout.
        assert_eq!(rec.format(b'|'), "100:1:2|f0_3_1|1f|abc|a.txt|a.dat|9|-1|exec gzip %s\n");
    }

    #[test]
    fn test_command_may_contain_separator() {
        let mut rec = sample();
        rec.command = "exec sort|uniq".to_string();
        let parsed = ProductionRecord::parse(&rec.format(b'|'), b'|').unwrap();
        assert_eq!(parsed.command, "exec sort|uniq");
    }

    #[test]
    fn test_truncated_record_rejected() {
        assert!(ProductionRecord::parse("100:1:1|2.0.1f4|f0_3_1|1f\n", b'|').is_err());
    }
}
