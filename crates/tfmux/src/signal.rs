//! POSIX signal names and delivery.

use thiserror::Error;

/// Signals that can be configured by name.
const SIGNALS: &[(&str, libc::c_int)] = &[
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGQUIT", libc::SIGQUIT),
    ("SIGILL", libc::SIGILL),
    ("SIGTRAP", libc::SIGTRAP),
    ("SIGABRT", libc::SIGABRT),
    ("SIGBUS", libc::SIGBUS),
    ("SIGFPE", libc::SIGFPE),
    ("SIGKILL", libc::SIGKILL),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGSEGV", libc::SIGSEGV),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGPIPE", libc::SIGPIPE),
    ("SIGALRM", libc::SIGALRM),
    ("SIGTERM", libc::SIGTERM),
    ("SIGCHLD", libc::SIGCHLD),
    ("SIGCONT", libc::SIGCONT),
    ("SIGSTOP", libc::SIGSTOP),
    ("SIGTSTP", libc::SIGTSTP),
    ("SIGTTIN", libc::SIGTTIN),
    ("SIGTTOU", libc::SIGTTOU),
    ("SIGURG", libc::SIGURG),
    ("SIGXCPU", libc::SIGXCPU),
    ("SIGXFSZ", libc::SIGXFSZ),
    ("SIGVTALRM", libc::SIGVTALRM),
    ("SIGPROF", libc::SIGPROF),
    ("SIGWINCH", libc::SIGWINCH),
    ("SIGIO", libc::SIGIO),
    ("SIGSYS", libc::SIGSYS),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalParseError {
    #[error("unknown signal: {0}")]
    Unknown(String),
}

/// A signal number with a known name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(libc::c_int);

impl Signal {
    pub const HUP: Signal = Signal(libc::SIGHUP);
    pub const KILL: Signal = Signal(libc::SIGKILL);

    /// Parse `SIGHUP`, `HUP`, `hup` or `1`.
    pub fn parse(value: &str) -> Result<Self, SignalParseError> {
        let trimmed = value.trim();
        if let Ok(number) = trimmed.parse::<libc::c_int>() {
            return Self::from_code(number)
                .ok_or_else(|| SignalParseError::Unknown(value.to_string()));
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        SIGNALS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, n)| Signal(*n))
            .ok_or_else(|| SignalParseError::Unknown(value.to_string()))
    }

    /// Look up a signal by number.
    pub fn from_code(code: i32) -> Option<Self> {
        SIGNALS
            .iter()
            .find(|(_, n)| *n == code)
            .map(|(_, n)| Signal(*n))
    }

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        SIGNALS
            .iter()
            .find(|(_, n)| *n == self.0)
            .map(|(name, _)| *name)
            .unwrap_or("SIGUNKNOWN")
    }

    /// Deliver this signal to `pid`.
    pub fn send(&self, pid: u32) -> std::io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions. Callers only
        // pass pids of children that have not been reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, self.0) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// All supported signals, in numeric order.
    pub fn all() -> Vec<Signal> {
        let mut signals: Vec<Signal> = SIGNALS.iter().map(|(_, n)| Signal(*n)).collect();
        signals.sort_by_key(|s| s.0);
        signals
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::HUP
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
