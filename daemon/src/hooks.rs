use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use common::logs::{EventAction, EventClass, EventRecord, LogSet};

use crate::config::ActionConfig;

const POLL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// User action scripts run on directory state transitions.
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    actions: ActionConfig,
}

impl Hooks {
    pub fn new(actions: ActionConfig) -> Self {
        Self { actions }
    }

    fn script_for(&self, action: EventAction) -> Option<&Path> {
        let script = match action {
            EventAction::ErrorStart | EventAction::ErrorEnd => &self.actions.error_action,
            EventAction::InfoTimeSet | EventAction::InfoTimeUnset => &self.actions.info_action,
            EventAction::WarnTimeSet | EventAction::WarnTimeUnset => &self.actions.warn_action,
            EventAction::MaxCopiedSet => return None,
        };
        script.as_deref()
    }

    /// Writes the event record, then runs the matching hook if one is set.
    pub fn emit(
        &self,
        logs: &mut LogSet,
        now: i64,
        class: EventClass,
        action: EventAction,
        alias: &str,
        text: Option<String>,
    ) {
        let record = EventRecord {
            time: now,
            class,
            action,
            alias: alias.to_string(),
            text,
        };
        if let Err(e) = logs.event(&record) {
            log::error!("Failed to write event log: {}", e);
        }
        log::info!("{}: {}", alias, action);

        let (Some(script), Some(phase)) = (self.script_for(action), action.hook_phase()) else {
            return;
        };
        match run_with_timeout(script, &[alias, phase], self.actions.timeout()) {
            Ok(outcome) => {
                if !outcome.output.trim().is_empty() {
                    log::info!("{} {} {}: {}", script.display(), alias, phase, outcome.output.trim());
                }
                match outcome.status {
                    Some(0) => {}
                    Some(code) => log::warn!("{} {} {} exited with {}", script.display(), alias, phase, code),
                    None if outcome.timed_out => {
                        log::warn!(
                            "{} {} {} exceeded timeout of {}s, terminated",
                            script.display(),
                            alias,
                            phase,
                            self.actions.timeout_secs
                        )
                    }
                    None => log::warn!("{} {} {} killed by a signal", script.display(), alias, phase),
                }
            }
            Err(e) => log::error!("Failed to run {}: {}", script.display(), e),
        }
    }
}

#[derive(Debug)]
pub struct HookOutcome {
    pub status: Option<i32>,
    pub timed_out: bool,
    pub output: String,
}

/// Runs `script args…`, terminating it (SIGTERM, then SIGKILL after a
/// grace period) when it outlives `timeout`.
pub fn run_with_timeout(script: &Path, args: &[&str], timeout: Duration) -> std::io::Result<HookOutcome> {
    let mut child = Command::new(PathBuf::from(script))
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            break terminate(&mut child)?;
        }
        thread::sleep(POLL);
    };

    let mut output = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut output)?;
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_string(&mut output)?;
    }
    Ok(HookOutcome {
        status: status.code(),
        timed_out,
        output,
    })
}

fn terminate(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL);
    }
    let _ = kill(pid, Signal::SIGKILL);
    child.wait()
}
