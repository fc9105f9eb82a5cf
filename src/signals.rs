use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Process-wide cooperative shutdown flag.
///
/// SIGTERM and SIGINT set this flag and do nothing else — no allocation, no
/// I/O inside the handler. The monitor loop polls it once per iteration
/// boundary; no other component reads it.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the termination handlers for the current process.
pub fn install() -> Result<(), nix::Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

/// Whether a termination signal has been observed.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    // Raising SIGTERM at ourselves exercises the real handler path. The flag
    // is intentionally left set afterwards; nothing else in the test binary
    // reads it.
    #[test]
    fn test_sigterm_sets_shutdown_flag() {
        install().unwrap();
        raise(Signal::SIGTERM).unwrap();
        assert!(shutdown_requested());
    }
}
