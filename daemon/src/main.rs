mod config;
mod dir_check;
mod dir_config;
mod dupcheck;
mod fanout;
mod filters;
mod gates;
mod hooks;
mod migrate;
mod passwd;
mod production;
mod scheduler;
mod signals;
mod supervisor;
mod watcher;

#[cfg(test)]
mod scenarios;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use common::WorkPaths;

use config::AfdConfig;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(author, version, about = "AFD automatic message generator", long_about = None)]
struct Cli {
    /// Work directory (defaults to $AFD_WORK_DIR)
    #[arg(short = 'w', long = "work-dir", global = true)]
    work_dir: Option<PathBuf>,
    /// AFD_CONFIG file to use instead of the one in etc/
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and its dir_check workers (default)
    Supervise,
    /// Run one dir_check worker
    DirCheck {
        #[arg(long, default_value_t = 0)]
        worker: u32,
        #[arg(long, default_value_t = 1)]
        workers: u32,
    },
    /// Parse the configuration and print a summary
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = match cli.work_dir {
        Some(dir) => WorkPaths::new(dir),
        None => WorkPaths::from_env(),
    };

    match cli.command.unwrap_or(Commands::Supervise) {
        Commands::Supervise => {
            std::fs::create_dir_all(paths.log_dir())
                .with_context(|| format!("Failed to create {}", paths.log_dir().display()))?;
            setup_logging(&paths, "amg", configured_level(&paths, cli.config.as_deref()))?;
            log::info!("Starting AMG in {}", paths.root().display());
            let supervisor = Supervisor::start(paths, cli.config)?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(supervisor.run())
        }
        Commands::DirCheck { worker, workers } => {
            let level = configured_level(&paths, cli.config.as_deref());
            setup_logging(&paths, &format!("dir_check[{}]", worker), level)?;
            dir_check::run_worker(paths, cli.config, worker, workers.max(1))
        }
        Commands::CheckConfig => check_config(&paths, cli.config.as_deref()),
    }
}

fn check_config(paths: &WorkPaths, config_path: Option<&Path>) -> anyhow::Result<()> {
    setup_stderr_logging()?;
    let config = AfdConfig::load(&paths.etc_dir(), config_path)?;
    config.logging.separator_byte()?;
    config.logging.level_filter()?;
    let (rules, passwords) = dir_config::load_rule_set(&config, paths, &mut dir_config::HashIds, 0)?;
    println!(
        "{} directories, {} file groups, {} destination groups, {} recipients, {} hosts, {} passwords",
        rules.dirs.len(),
        rules.file_groups.len(),
        rules.dest_groups.len(),
        rules.recipients.len(),
        rules.hosts.len(),
        passwords.len()
    );
    for dir in &rules.dirs {
        println!("{:<16} {:08x} {}", dir.alias, dir.dir_id, dir.path.display());
        for r in rules.recipients.iter().filter(|r| rules[r.dir].dir_id == dir.dir_id) {
            println!("    {:08x} {}", r.job_id, r.url);
        }
    }
    Ok(())
}

fn setup_stderr_logging() -> anyhow::Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log::LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

/// `logging.level` from AFD_CONFIG, or info when it cannot be read.
fn configured_level(paths: &WorkPaths, config_path: Option<&Path>) -> log::LevelFilter {
    AfdConfig::load(&paths.etc_dir(), config_path)
        .ok()
        .and_then(|c| c.logging.level_filter().ok())
        .unwrap_or(log::LevelFilter::Info)
}

fn setup_logging(paths: &WorkPaths, process: &str, default_level: log::LevelFilter) -> anyhow::Result<()> {
    let level = std::env::var("AMG_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(default_level);
    let process = process.to_string();

    let base_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                process,
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // System log: everything except the receive log
    let main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "receive_log")
        .chain(std::io::stdout())
        .chain(fern::log_file(paths.system_log())?);

    // Receive log: only pickup summaries
    let receive_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() == "receive_log")
        .chain(fern::log_file(paths.receive_log())?);

    base_config.chain(main_log).chain(receive_log).apply()?;

    Ok(())
}
