//! Command line of `alda`.
//!
//! The traditional short forms `-SI`, `-SU`, `-SP`, `-SO`, `-SD` and `-DP`,
//! `-DO` carry the stage in the option name; they are rewritten to long
//! options before clap sees them.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::query::DeleteMatchPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "alda",
    version,
    about = "Trace files through the AFD logs",
    disable_help_flag = true
)]
pub struct Args {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Keep following the logs
    #[arg(short = 'c', conflicts_with = "daemon")]
    pub continuous: bool,

    /// Continuous mode that also rotates the -O file daily
    #[arg(short = 'C')]
    pub daemon: bool,

    /// Only this AFD (default)
    #[arg(short = 'l', conflicts_with = "remote")]
    pub local: bool,

    /// Follow files into other AFDs listed in AFD_HOST_LIST
    #[arg(short = 'r')]
    pub remote: bool,

    /// Search from Output/Delete back to Input
    #[arg(short = 'b', conflicts_with = "forward")]
    pub backward: bool,

    /// Search from Input forward (default)
    #[arg(short = 'f')]
    pub forward: bool,

    /// AFD to start in (%alias, #hex-id or name)
    #[arg(short = 's', value_name = "AFD")]
    pub start_afd: Option<String>,

    /// AFD to stop at
    #[arg(short = 'e', value_name = "AFD")]
    pub end_afd: Option<String>,

    /// Start of the time window (MMDDhhmmss, MMDDhhmm, DDhhmm, hhmm, -mm, -hhmm, -DDhhmm)
    #[arg(short = 't', value_name = "TIME", allow_hyphen_values = true)]
    pub start_time: Option<String>,

    /// End of the time window
    #[arg(short = 'T', value_name = "TIME", allow_hyphen_values = true)]
    pub end_time: Option<String>,

    /// Logs to search, any of I U P C R O D
    #[arg(short = 'L', value_name = "LOGS")]
    pub logs: Option<String>,

    /// Most seconds between two stages of one file
    #[arg(short = 'g', value_name = "SECS")]
    pub max_diff_time: Option<i64>,

    /// Most minutes one search may take
    #[arg(short = 'G', value_name = "MINUTES")]
    pub max_search_time: Option<u64>,

    /// Directories (alias, path or #hex-id)
    #[arg(short = 'd', value_name = "DIR", value_delimiter = ',')]
    pub dirs: Vec<String>,

    /// Host aliases (masks allowed)
    #[arg(short = 'h', value_name = "HOST", value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Job id (hex)
    #[arg(short = 'j', value_name = "HEX")]
    pub job_id: Option<String>,

    /// Unique number (hex)
    #[arg(short = 'u', value_name = "HEX")]
    pub unique: Option<String>,

    /// Original size before any production, e.g. '>1024'
    #[arg(short = 'z', value_name = "CMP", allow_hyphen_values = true)]
    pub original_size: Option<String>,

    /// Size where the search starts (-S)
    #[arg(long = "size", value_name = "CMP", allow_hyphen_values = true)]
    pub size: Option<String>,

    /// Input size (-SI)
    #[arg(long = "size-input", value_name = "CMP", allow_hyphen_values = true)]
    pub size_input: Option<String>,

    /// Distribution size (-SU)
    #[arg(long = "size-distribution", value_name = "CMP", allow_hyphen_values = true)]
    pub size_distribution: Option<String>,

    /// Size after production (-SP)
    #[arg(long = "size-production", value_name = "CMP", allow_hyphen_values = true)]
    pub size_production: Option<String>,

    /// Output size (-SO)
    #[arg(long = "size-output", value_name = "CMP", allow_hyphen_values = true)]
    pub size_output: Option<String>,

    /// Delete size (-SD)
    #[arg(long = "size-delete", value_name = "CMP", allow_hyphen_values = true)]
    pub size_delete: Option<String>,

    /// Production duration in seconds (-DP)
    #[arg(long = "duration-production", value_name = "CMP", allow_hyphen_values = true)]
    pub duration_production: Option<String>,

    /// Transmission duration in seconds (-DO)
    #[arg(long = "duration-output", value_name = "CMP", allow_hyphen_values = true)]
    pub duration_output: Option<String>,

    /// Protocols, comma separated (ftp, sftp, file, ...)
    #[arg(short = 'p', value_name = "LIST")]
    pub protocols: Option<String>,

    /// Output format
    #[arg(short = 'o', value_name = "FORMAT")]
    pub format: Option<String>,

    /// Footer file
    #[arg(short = 'F', value_name = "FILE")]
    pub footer: Option<PathBuf>,

    /// Header file
    #[arg(short = 'H', value_name = "FILE")]
    pub header: Option<PathBuf>,

    /// Header line; %I is the output inode, %H the AFD id
    #[arg(long = "header-line", value_name = "TEXT")]
    pub header_line: Option<String>,

    /// Output file instead of stdout
    #[arg(short = 'O', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Old output files kept by -C
    #[arg(short = 'R', value_name = "N", default_value_t = 7)]
    pub rotate: u32,

    /// How Delete records without a unique number count going backward
    #[arg(long, value_enum, default_value_t = DeleteMatchPolicy::Miss)]
    pub unique_less_deletes: DeleteMatchPolicy,

    /// More output on stderr (repeat for more)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// AFD work directory (default $AFD_WORK_DIR)
    #[arg(short = 'w', value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// File name masks
    #[arg(value_name = "MASK")]
    pub masks: Vec<String>,
}

fn stage_option(arg: &str, prefix: &str, stages: &[(char, &str)], bare: Option<&str>) -> Option<String> {
    let rest = arg.strip_prefix(prefix)?;
    let mut chars = rest.chars();
    let (long, value) = match chars.next() {
        Some(c) => match stages.iter().find(|(s, _)| *s == c) {
            Some((_, long)) => (*long, chars.as_str()),
            None => (bare?, rest),
        },
        None => (bare?, ""),
    };
    Some(if value.is_empty() {
        format!("--{}", long)
    } else {
        format!("--{}={}", long, value)
    })
}

/// Rewrites stage-carrying short options into their long forms.
pub fn normalize<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    const SIZES: &[(char, &str)] = &[
        ('I', "size-input"),
        ('U', "size-distribution"),
        ('P', "size-production"),
        ('O', "size-output"),
        ('D', "size-delete"),
    ];
    const DURATIONS: &[(char, &str)] = &[('P', "duration-production"), ('O', "duration-output")];

    args.into_iter()
        .map(Into::into)
        .map(|arg: OsString| {
            let Some(s) = arg.to_str() else { return arg };
            if let Some(rest) = s.strip_prefix("--header_line") {
                return format!("--header-line{}", rest).into();
            }
            if s.starts_with("--") {
                return arg;
            }
            stage_option(s, "-S", SIZES, Some("size"))
                .or_else(|| stage_option(s, "-D", DURATIONS, None))
                .map(OsString::from)
                .unwrap_or(arg)
        })
        .collect()
}

impl Args {
    pub fn parse_from_env() -> Self {
        Self::parse_from(normalize(std::env::args_os()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &[&str]) -> Args {
        Args::try_parse_from(normalize(line.iter().copied())).unwrap()
    }

    #[test]
    fn test_normalize_stage_options() {
        let got: Vec<OsString> = normalize(["alda", "-SI", ">10", "-SO<5", "-S", "=3", "-DP>1", "--header_line=x %I"]);
        let want: Vec<OsString> = [
            "alda",
            "--size-input",
            ">10",
            "--size-output=<5",
            "--size",
            "=3",
            "--duration-production=>1",
            "--header-line=x %I",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_parse_flags() {
        let args = parse(&["alda", "-b", "-h", "edge,hub", "-t", "-0130", "-SO", ">1024", "-vv", "-L", "OD", "*.txt"]);
        assert!(args.backward && !args.forward);
        assert_eq!(args.hosts, vec!["edge", "hub"]);
        assert_eq!(args.start_time.as_deref(), Some("-0130"));
        assert_eq!(args.size_output.as_deref(), Some(">1024"));
        assert_eq!(args.verbose, 2);
        assert_eq!(args.masks, vec!["*.txt"]);
        assert_eq!(args.unique_less_deletes, DeleteMatchPolicy::Miss);
        assert!(Args::try_parse_from(["alda", "-b", "-f"]).is_err());
    }
}
