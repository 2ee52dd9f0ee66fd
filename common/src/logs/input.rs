use super::{parse_hex_u32, parse_hex_u64, sep_char, split_time};
use crate::error::{AfdError, Result};

const LOG: &str = "input";

/// `<hex-time> <filename> SEP <hex-size> SEP <hex-dir-id> SEP <hex-unique>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    pub time: i64,
    pub filename: String,
    pub size: u64,
    pub dir_id: u32,
    pub unique_number: u32,
}

impl InputRecord {
    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        format!(
            "{:x} {}{s}{:x}{s}{:x}{s}{:x}\n",
            self.time, self.filename, self.size, self.dir_id, self.unique_number
        )
    }

    pub fn parse(line: &str, sep: u8) -> Result<Self> {
        let (time, rest) = split_time(line, LOG)?;
        // The file name is the only field that may contain the separator,
        // so split from the right.
        let mut fields = rest.rsplitn(4, sep_char(sep));
        let unique = fields.next();
        let dir_id = fields.next();
        let size = fields.next();
        let filename = fields.next();
        match (filename, size, dir_id, unique) {
            (Some(filename), Some(size), Some(dir_id), Some(unique)) if !filename.is_empty() => {
                Ok(InputRecord {
                    time,
                    filename: filename.to_string(),
                    size: parse_hex_u64(size, LOG, "size")?,
                    dir_id: parse_hex_u32(dir_id, LOG, "directory id")?,
                    unique_number: parse_hex_u32(unique, LOG, "unique number")?,
                })
            }
            _ => Err(AfdError::integrity(LOG, format!("too few fields in '{}'", rest))),
        }
    }
}
