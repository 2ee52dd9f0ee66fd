use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport schemes a recipient or remote directory may use. The numeric
/// value is the bit written (as hex) into the output log protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
    Scp,
    Http,
    Https,
    Smtp,
    Loc,
    Exec,
    Wmo,
}

impl Protocol {
    pub const ALL: [Protocol; 10] = [
        Protocol::Ftp,
        Protocol::Ftps,
        Protocol::Sftp,
        Protocol::Scp,
        Protocol::Http,
        Protocol::Https,
        Protocol::Smtp,
        Protocol::Loc,
        Protocol::Exec,
        Protocol::Wmo,
    ];

    pub fn bit(self) -> u32 {
        match self {
            Protocol::Ftp => 0x1,
            Protocol::Loc => 0x2,
            Protocol::Smtp => 0x4,
            Protocol::Sftp => 0x8,
            Protocol::Scp => 0x10,
            Protocol::Wmo => 0x20,
            Protocol::Http => 0x40,
            Protocol::Exec => 0x80,
            Protocol::Ftps => 0x100,
            Protocol::Https => 0x200,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
            Protocol::Scp => "scp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Smtp => "mailto",
            Protocol::Loc => "file",
            Protocol::Exec => "exec",
            Protocol::Wmo => "wmo",
        }
    }

    pub fn from_bit(bit: u32) -> Option<Protocol> {
        Self::ALL.iter().copied().find(|p| p.bit() == bit)
    }

    /// Protocols set in a bit union.
    pub fn from_mask(mask: u32) -> Vec<Protocol> {
        Self::ALL.iter().copied().filter(|p| mask & p.bit() != 0).collect()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ftp" => Ok(Protocol::Ftp),
            "ftps" => Ok(Protocol::Ftps),
            "sftp" => Ok(Protocol::Sftp),
            "scp" => Ok(Protocol::Scp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "mailto" | "smtp" => Ok(Protocol::Smtp),
            "file" | "loc" => Ok(Protocol::Loc),
            "exec" => Ok(Protocol::Exec),
            "wmo" => Ok(Protocol::Wmo),
            other => Err(format!("unknown scheme '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let mut seen = 0u32;
        for p in Protocol::ALL {
            assert_eq!(seen & p.bit(), 0, "{} reuses a bit", p);
            seen |= p.bit();
            assert_eq!(Protocol::from_bit(p.bit()), Some(p));
        }
        assert_eq!(Protocol::from_mask(0x1 | 0x8), vec![Protocol::Ftp, Protocol::Sftp]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("SMTP".parse::<Protocol>().unwrap(), Protocol::Smtp);
        assert_eq!("loc".parse::<Protocol>().unwrap(), Protocol::Loc);
        assert!("gopher".parse::<Protocol>().is_err());
    }
}
