// Severity/facility logging to stderr.
//
// Statistics reports are deliberately NOT routed through here: they are part
// of the tool's observable output and go to stdout (see stats.rs).

use std::io::Write;

/// Log severity levels (RFC 5424 syslog numbering, lower is more severe).
///
/// Fatal conditions do not pass through here: setup and runtime fatals
/// surface as errors on the way out of `main`, and buffer-full drops are
/// silent outside the aggregate statistics.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Error conditions (failed write, bad subprocess exit)
    Error = 3,
    /// Warning conditions (wrong-size datagram, state races)
    Warning = 4,
    /// Significant normal condition (file opened, session transition)
    Notice = 5,
    /// Informational
    Info = 6,
    /// Debug-level messages
    Debug = 7,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logging facility - identifies which component generated the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    /// Session lifecycle, startup, shutdown
    Session,
    /// Socket/stdin receive path
    Ingress,
    /// File write path, file lifecycle
    Egress,
    /// Ring buffer
    Ring,
    /// Socket setup
    Network,
    /// Signal and timer handling
    Signals,
}

impl Facility {
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Session => "Session",
            Facility::Ingress => "Ingress",
            Facility::Egress => "Egress",
            Facility::Ring => "Ring",
            Facility::Network => "Network",
            Facility::Signals => "Signals",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logger handle for writing log lines.
///
/// Lightweight, can be cloned and passed to every thread. Lines below the
/// configured minimum severity are dropped.
#[derive(Debug, Clone)]
pub struct Logger {
    min: Severity,
}

impl Logger {
    pub fn new(min: Severity) -> Self {
        Self { min }
    }

    /// Info-level logger, or debug-level when `verbose` is set.
    pub fn for_verbosity(verbose: bool) -> Self {
        Self::new(if verbose {
            Severity::Debug
        } else {
            Severity::Info
        })
    }

    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity > self.min {
            return;
        }
        // Format: [TIMESTAMP] [SEVERITY] [Facility] message
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(
            std::io::stderr(),
            "[{}] [{}] [{}] {}",
            timestamp,
            severity,
            facility,
            message
        );
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}
