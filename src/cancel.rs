//! Cooperative cancellation for operator interrupts.
//!
//! SIGINT/SIGTERM set a process-wide flag. A [`CancelToken`] created by
//! [`install_interrupt_handler`] observes that flag; tokens can also be
//! cancelled directly, which is what tests do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Shared cancellation flag checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    follows_signals: bool,
}

impl CancelToken {
    /// A token that is only cancelled through [`Self::cancel`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follows_signals && INTERRUPTED.load(Ordering::SeqCst))
    }
}

/// Route SIGINT and SIGTERM into a cancellation token.
///
/// The handler only stores to an atomic. Child processes in the foreground
/// process group receive the terminal's SIGINT themselves.
pub fn install_interrupt_handler() -> std::io::Result<CancelToken> {
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler is async-signal-safe (a single atomic store).
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(CancelToken {
        flag: Arc::new(AtomicBool::new(false)),
        follows_signals: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();

        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_plain_token_ignores_signal_flag() {
        let token = CancelToken::new();
        assert!(!token.follows_signals);
        assert!(!token.is_cancelled());
    }
}
