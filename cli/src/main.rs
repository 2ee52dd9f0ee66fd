mod args;
mod cache;
mod follow;
mod format;
mod hostlist;
mod output;
mod query;
mod search;
mod timespec;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use common::logs::LogKind;
use common::mask::FileMask;
use common::{NameRegistry, WorkPaths};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use args::Args;
use follow::Follower;
use format::{Format, DEFAULT_FORMAT};
use hostlist::{afd_id, HostList};
use output::{Header, OutputSink};
use query::{parse_log_letters, parse_protocols, Direction, Query};
use search::{follow_remote, LogStore, Searcher, Trace};

/// Pause between two polls in continuous mode.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_stop_handlers() -> nix::Result<()> {
    let term = SigAction::new(SigHandler::Handler(on_terminate), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
    }
    Ok(())
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_env("ALDA_LOG")
        .init();
}

fn hex(what: &str, s: &str) -> Result<u32> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| anyhow!("{} '{}' is not a hex number", what, s))
}

fn masks(list: &[String]) -> Result<Vec<FileMask>> {
    list.iter()
        .map(|m| m.parse::<FileMask>().map_err(|e| anyhow!("Bad mask '{}': {}", m, e)))
        .collect()
}

/// Directory aliases from the name registry, if the AMG ever wrote one.
fn dir_aliases(paths: &WorkPaths) -> Result<HashMap<u32, String>> {
    let path = paths.dir_name_file();
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut registry = NameRegistry::attach_dirs(&path).with_context(|| format!("Failed to attach {}", path.display()))?;
    let aliases = registry.entries()?.into_iter().map(|e| (e.id, e.label)).collect();
    registry.detach();
    Ok(aliases)
}

/// `-d` takes `#hex-id`, an alias or a directory path.
fn resolve_dirs(specs: &[String], paths: &WorkPaths) -> Result<Option<HashSet<u32>>> {
    if specs.is_empty() {
        return Ok(None);
    }
    let path = paths.dir_name_file();
    let registry = if path.exists() {
        Some(NameRegistry::attach_dirs(&path).with_context(|| format!("Failed to attach {}", path.display()))?)
    } else {
        None
    };
    let mut ids = HashSet::new();
    for spec in specs {
        if let Some(id) = spec.strip_prefix('#') {
            ids.insert(hex("directory id", id)?);
            continue;
        }
        let found: Vec<u32> = match &registry {
            Some(r) => {
                let by_alias: Vec<u32> = r.lookup_label(spec).into_iter().map(|e| e.id).collect();
                if by_alias.is_empty() {
                    r.lookup_key(spec).map(|e| e.id).into_iter().collect()
                } else {
                    by_alias
                }
            }
            None => Vec::new(),
        };
        if found.is_empty() {
            bail!("Unknown directory '{}'", spec);
        }
        ids.extend(found);
    }
    Ok(Some(ids))
}

fn build_query(args: &Args, paths: &WorkPaths) -> Result<Query> {
    let now = Local::now();
    let direction = if args.backward {
        Direction::Backward
    } else {
        Direction::Forward
    };
    let mut query = Query {
        direction,
        unique_less_deletes: args.unique_less_deletes,
        ..Query::default()
    };
    if let Some(t) = &args.start_time {
        query.start = Some(timespec::parse(t, now)?);
    }
    if let Some(t) = &args.end_time {
        query.end = Some(timespec::parse(t, now)?);
    }
    if let (Some(s), Some(e)) = (query.start, query.end) {
        if s > e {
            bail!("The time window ends before it starts");
        }
    }
    query.masks = masks(&args.masks)?;
    query.hosts = masks(&args.hosts)?;
    query.dir_ids = resolve_dirs(&args.dirs, paths)?;
    if let Some(p) = &args.protocols {
        query.protocols = parse_protocols(p)?;
    }
    query.job_id = args.job_id.as_deref().map(|j| hex("job id", j)).transpose()?;
    query.unique = args.unique.as_deref().map(|u| hex("unique number", u)).transpose()?;
    query.original_size = args.original_size.as_deref().map(str::parse).transpose()?;

    let start_kind = match direction {
        Direction::Forward => LogKind::Input,
        Direction::Backward => LogKind::Output,
    };
    for (kind, cmp) in [
        (start_kind, &args.size),
        (LogKind::Input, &args.size_input),
        (LogKind::Distribution, &args.size_distribution),
        (LogKind::Production, &args.size_production),
        (LogKind::Output, &args.size_output),
        (LogKind::Delete, &args.size_delete),
    ] {
        if let Some(cmp) = cmp {
            query.sizes.push((kind, cmp.parse()?));
        }
    }
    for (kind, cmp) in [
        (LogKind::Production, &args.duration_production),
        (LogKind::Output, &args.duration_output),
    ] {
        if let Some(cmp) = cmp {
            query.durations.push((kind, cmp.parse()?));
        }
    }

    if let Some(letters) = &args.logs {
        query.logs = parse_log_letters(letters)?;
        match direction {
            Direction::Forward => {
                query.logs.insert(LogKind::Input);
            }
            Direction::Backward => {
                if !query.uses(LogKind::Output) && !query.uses(LogKind::Delete) {
                    bail!("A backward search needs the O or D log (see -L)");
                }
            }
        }
    }
    query.max_diff_time = args.max_diff_time;
    query.max_search_time = args.max_search_time.map(|m| Duration::from_secs(m * 60));
    Ok(query)
}

/// The AFD whose logs are searched first, with the alias shown by `%A`.
fn starting_afd(args: &Args, paths: &WorkPaths, hosts: &HostList) -> Result<(String, WorkPaths)> {
    if let Some(spec) = &args.start_afd {
        let host = hosts
            .find(spec)
            .ok_or_else(|| anyhow!("AFD '{}' is not in {}", spec, paths.afd_host_list().display()))?;
        return Ok((host.alias.clone(), WorkPaths::new(&host.work_dir)));
    }
    let alias = hosts
        .hosts
        .iter()
        .find(|h| h.work_dir == paths.root())
        .map(|h| h.alias.clone())
        .unwrap_or_else(|| "local".to_string());
    Ok((alias, paths.clone()))
}

fn emit(sink: &mut OutputSink, format: &Format, traces: &[Trace]) -> Result<()> {
    for trace in traces {
        sink.write_line(&format.render(trace))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse_from_env();
    setup_logging(args.verbose);

    let paths = match &args.work_dir {
        Some(dir) => WorkPaths::new(dir),
        None => WorkPaths::from_env(),
    };
    let hosts = HostList::load(&paths.afd_host_list())?;
    let (alias, afd_paths) = starting_afd(&args, &paths, &hosts)?;
    let query = build_query(&args, &afd_paths)?;
    let remote = args.remote && !args.local;
    if remote && query.direction == Direction::Backward {
        log::warn!("Only forward searches continue into other AFDs");
    }

    let format = Format::parse(args.format.as_deref().unwrap_or(DEFAULT_FORMAT))?
        .with_dir_aliases(dir_aliases(&afd_paths)?);
    let header = Header {
        file: args.header.clone(),
        line: args.header_line.clone(),
        afd_id: afd_id(afd_paths.root()),
    };
    let mut sink = OutputSink::new(args.output.as_deref(), header, args.footer.clone())?;
    if args.daemon && args.output.is_some() {
        sink = sink.with_rotation(args.rotate, Local::now().timestamp());
    }
    sink.write_header()?;

    let store = LogStore::open(&alias, &afd_paths)?;
    let searcher = Searcher::new(store, &query);
    let crosses = remote && query.direction == Direction::Forward;

    if args.continuous || args.daemon {
        install_stop_handlers().context("Failed to install signal handlers")?;
        let mut follower = Follower::new(searcher)?;
        log::info!("Following the logs of {} in {}", alias, afd_paths.root().display());
        while !STOP.load(Ordering::SeqCst) {
            let now = Local::now().timestamp();
            sink.rotate_if_due(now)?;
            let mut traces = follower.poll(now)?;
            if crosses && !traces.is_empty() {
                let hops = follow_remote(&traces, &hosts, &query, args.end_afd.as_deref())?;
                traces.extend(hops);
            }
            emit(&mut sink, &format, &traces)?;
            sink.flush()?;
            thread::sleep(POLL_INTERVAL);
        }
        log::info!("{} traces reported", follower.searcher().stats.traces);
    } else {
        let mut searcher = searcher;
        let mut traces = searcher.run()?;
        if crosses {
            let hops = follow_remote(&traces, &hosts, &query, args.end_afd.as_deref())?;
            traces.extend(hops);
        }
        emit(&mut sink, &format, &traces)?;
        let stats = searcher.stats;
        if stats.exhausted {
            log::warn!("Search time ran out; results are partial");
        } else if stats.partial() {
            log::warn!("{} of {} traces stop early (-g); results are partial", stats.cut, stats.traces);
        }
        log::info!("{} traces found", stats.traces);
    }
    sink.finish()
}
