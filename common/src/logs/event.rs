use std::fmt;

use super::{parse_hex_u32, sep_char, split_time};
use crate::error::{AfdError, Result};

const LOG: &str = "event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Directory,
    Host,
}

impl EventClass {
    fn letter(self) -> char {
        match self {
            EventClass::Directory => 'D',
            EventClass::Host => 'H',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    ErrorStart = 1,
    ErrorEnd = 2,
    InfoTimeSet = 3,
    InfoTimeUnset = 4,
    WarnTimeSet = 5,
    WarnTimeUnset = 6,
    MaxCopiedSet = 7,
}

impl EventAction {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => EventAction::ErrorStart,
            2 => EventAction::ErrorEnd,
            3 => EventAction::InfoTimeSet,
            4 => EventAction::InfoTimeUnset,
            5 => EventAction::WarnTimeSet,
            6 => EventAction::WarnTimeUnset,
            7 => EventAction::MaxCopiedSet,
            _ => return None,
        })
    }

    /// `start`/`stop` argument handed to action hooks, `None` when the
    /// action has no hook.
    pub fn hook_phase(self) -> Option<&'static str> {
        match self {
            EventAction::ErrorStart | EventAction::InfoTimeSet | EventAction::WarnTimeSet => {
                Some("start")
            }
            EventAction::ErrorEnd | EventAction::InfoTimeUnset | EventAction::WarnTimeUnset => {
                Some("stop")
            }
            EventAction::MaxCopiedSet => None,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EventAction::ErrorStart => "error start",
            EventAction::ErrorEnd => "error end",
            EventAction::InfoTimeSet => "info time set",
            EventAction::InfoTimeUnset => "info time unset",
            EventAction::WarnTimeSet => "warn time set",
            EventAction::WarnTimeUnset => "warn time unset",
            EventAction::MaxCopiedSet => "max copied set",
        };
        f.write_str(text)
    }
}

/// `<hex-time> <class> SEP E SEP <hex-action> SEP <alias> [SEP <text>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub time: i64,
    pub class: EventClass,
    pub action: EventAction,
    pub alias: String,
    pub text: Option<String>,
}

impl EventRecord {
    pub fn format(&self, sep: u8) -> String {
        let s = sep_char(sep);
        let mut line = format!(
            "{:x} {}{s}E{s}{:x}{s}{}",
            self.time,
            self.class.letter(),
            self.action.code(),
            self.alias
        );
        if let Some(text) = &self.text {
            line.push(s);
            line.push_str(text);
        }
        line.push('\n');
        line
    }

    pub fn parse(line: &str, sep: u8) -> Result<Self> {
        let (time, rest) = split_time(line, LOG)?;
        let mut fields = rest.splitn(5, sep_char(sep));
        let (Some(class), Some(_kind), Some(action), Some(alias)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(AfdError::integrity(LOG, format!("too few fields in '{}'", rest)));
        };
        let class = match class {
            "D" => EventClass::Directory,
            "H" => EventClass::Host,
            other => return Err(AfdError::integrity(LOG, format!("unknown class '{}'", other))),
        };
        let code = parse_hex_u32(action, LOG, "action")?;
        let action = EventAction::from_code(code)
            .ok_or_else(|| AfdError::integrity(LOG, format!("unknown action {}", code)))?;
        Ok(EventRecord {
            time,
            class,
            action,
            alias: alias.to_string(),
            text: fields.next().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line() {
        let rec = EventRecord {
            time: 0x400,
            class: EventClass::Directory,
            action: EventAction::ErrorStart,
            alias: "A".to_string(),
            text: Some("3 errors".to_string()),
        };
        let line = rec.format(b'|');
        assert_eq!(line, "400 D|E|1|A|3 errors\n");
        assert_eq!(EventRecord::parse(&line, b'|').unwrap(), rec);
    }

    #[test]
    fn test_hook_phase() {
        assert_eq!(EventAction::ErrorEnd.hook_phase(), Some("stop"));
        assert_eq!(EventAction::MaxCopiedSet.hook_phase(), None);
        assert!(EventRecord::parse("400 X|E|1|A\n", b'|').is_err());
    }
}
