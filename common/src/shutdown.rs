//! Flag-based termination handling.
//!
//! The signal handlers do nothing but set an atomic flag; the daemon's poll
//! loop observes the flag and performs cleanup itself (flush the clock,
//! remove the active snapshot) outside of signal context.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn flag_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT, SIGTERM and SIGQUIT.
pub fn install() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(flag_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        unsafe { sigaction(signal, &action) }
            .map_err(|errno| anyhow::anyhow!("failed installing {signal} handler: {errno}"))?;
    }
    Ok(())
}

/// True once a termination signal has been observed.
#[must_use]
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
