//! Signal flags of the dir_check workers.
//!
//! SIGTERM asks the worker to quiesce: the file being moved is finished,
//! nothing new is started. SIGHUP asks it to reload the rule set.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static QUIESCE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    QUIESCE.store(true, Ordering::SeqCst);
}

extern "C" fn on_hangup(_: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

pub fn install_worker_handlers() -> nix::Result<()> {
    let term = SigAction::new(SigHandler::Handler(on_terminate), SaFlags::SA_RESTART, SigSet::empty());
    let hup = SigAction::new(SigHandler::Handler(on_hangup), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handlers only store to atomics.
    unsafe {
        sigaction(Signal::SIGTERM, &term)?;
        sigaction(Signal::SIGINT, &term)?;
        sigaction(Signal::SIGHUP, &hup)?;
    }
    Ok(())
}

pub fn quiesce_requested() -> bool {
    QUIESCE.load(Ordering::SeqCst)
}

/// True once per SIGHUP.
pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_is_consumed() {
        RELOAD.store(true, Ordering::SeqCst);
        assert!(take_reload());
        assert!(!take_reload());
    }
}
