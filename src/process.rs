/// Process termination primitive.
///
/// Terminating on purpose is how the watchdog recovers: the alarms are held
/// outside this process, so a dead process is resurrected by the next fire.

/// Exit code for the sanctioned user exit (back pressed).
pub const EXIT_USER: i32 = 0;
/// Exit code after an uncaught failure (panic).
pub const EXIT_CRASH: i32 = 2;
/// Exit code when a hang exhausted the tolerated budget.
pub const EXIT_HANG: i32 = 3;

pub trait ProcessExit: Send + Sync {
    /// Terminate the current process with `code`.
    ///
    /// The real implementation never returns. Test doubles record the code.
    fn terminate(&self, code: i32);
}

/// Terminates via `std::process::exit`, skipping destructors and any timer
/// cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExit;

impl ProcessExit for SystemExit {
    fn terminate(&self, code: i32) {
        tracing::warn!(code, pid = std::process::id(), "terminating process");
        std::process::exit(code);
    }
}
