//! File masks and file-group evaluation.
//!
//! A mask is a shell glob, optionally prefixed with `!`. Within a group the
//! first mask that matches decides: a plain mask accepts the file, a
//! negated one rejects it for this group only. Groups are tried in order.

use std::fmt;
use std::str::FromStr;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileMask {
    text: String,
    pattern: Pattern,
    negate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMatch {
    Accept,
    Reject,
    NoMatch,
}

impl FileMask {
    pub fn is_negated(&self) -> bool {
        self.negate
    }

    /// True for the catch-all `*` mask.
    pub fn is_match_all(&self) -> bool {
        !self.negate && self.pattern.as_str() == "*"
    }

    /// Plain glob test, ignoring negation.
    pub fn matches(&self, name: &str) -> bool {
        self.pattern.matches_with(name, OPTIONS)
    }

    pub fn evaluate(&self, name: &str) -> MaskMatch {
        match (self.matches(name), self.negate) {
            (false, _) => MaskMatch::NoMatch,
            (true, false) => MaskMatch::Accept,
            (true, true) => MaskMatch::Reject,
        }
    }
}

impl FromStr for FileMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (negate, glob) = match text.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if glob.is_empty() {
            return Err("empty file mask".to_string());
        }
        let pattern = Pattern::new(glob).map_err(|e| format!("bad file mask '{}': {}", s, e))?;
        Ok(Self {
            text: text.to_string(),
            pattern,
            negate,
        })
    }
}

impl TryFrom<String> for FileMask {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FileMask> for String {
    fn from(mask: FileMask) -> Self {
        mask.text
    }
}

impl fmt::Display for FileMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Evaluates one group's masks in order.
pub fn evaluate_group(masks: &[FileMask], name: &str) -> MaskMatch {
    for mask in masks {
        match mask.evaluate(name) {
            MaskMatch::NoMatch => continue,
            decided => return decided,
        }
    }
    MaskMatch::NoMatch
}

/// Index of the first group accepting `name`.
pub fn first_accepting<'a, I>(groups: I, name: &str) -> Option<usize>
where
    I: IntoIterator<Item = &'a [FileMask]>,
{
    groups
        .into_iter()
        .position(|masks| evaluate_group(masks, name) == MaskMatch::Accept)
}

/// Every group accepting `name`; a file may feed several groups.
pub fn all_accepting<'a, I>(groups: I, name: &str) -> Vec<usize>
where
    I: IntoIterator<Item = &'a [FileMask]>,
{
    groups
        .into_iter()
        .enumerate()
        .filter(|(_, masks)| evaluate_group(masks, name) == MaskMatch::Accept)
        .map(|(i, _)| i)
        .collect()
}

pub fn any_matches(masks: &[FileMask], name: &str) -> bool {
    masks.iter().any(|m| m.matches(name))
}
