// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Shared recording-session state.
//!
//! The producer and consumer share the ring buffer under one mutex and the
//! stop flag under another. The stop flag is only ever mutated on ordinary
//! threads (the signal watcher, the producer's idle path, the consumer's
//! rearm), never in async-signal context.
//!
//! Lock order where both are held: ring, then stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::logging::{Facility, Logger};
use crate::ring::{FillStats, VirtualRing};
use crate::stats::CaptureStats;

/// Recording state of the session.
///
/// `EndFile` closes the current file but keeps listening; `Terminate` ends
/// the process once the ring is drained; `Split` is the consumer-local
/// "close and immediately reopen" state used for file-size splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCode {
    Running,
    EndFile,
    Terminate,
    Split,
}

impl StopCode {
    /// Numeric code used in diagnostics: 0 running, 1 end file,
    /// 2 terminate, -1 split.
    pub const fn code(self) -> i8 {
        match self {
            StopCode::Running => 0,
            StopCode::EndFile => 1,
            StopCode::Terminate => 2,
            StopCode::Split => -1,
        }
    }
}

/// Outcome of the consumer's attempt to rearm the stop flag.
#[derive(Debug, PartialEq, Eq)]
pub enum RearmOutcome {
    /// Flag reset to `Running`.
    Cleared,
    /// Flag was `Terminate`; it stays that way.
    KeptTerminate,
    /// Another thread changed the flag since the consumer's snapshot; the
    /// newer value wins.
    Changed { from: i8, to: i8 },
}

pub struct Session {
    ring: Mutex<VirtualRing>,
    /// Signalled by the consumer after releasing ring space.
    pub space_available: Condvar,
    /// Signalled by the producer after a commit, and by every stop
    /// transition so the consumer re-evaluates its predicate.
    pub data_available: Condvar,
    stopped: Mutex<StopCode>,
    file_open: AtomicBool,
    producer_running: AtomicBool,
    stdin_source: bool,
}

impl Session {
    pub fn new(ring: VirtualRing, stdin_source: bool) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(ring),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
            stopped: Mutex::new(StopCode::Running),
            file_open: AtomicBool::new(false),
            producer_running: AtomicBool::new(false),
            stdin_source,
        })
    }

    pub fn stdin_source(&self) -> bool {
        self.stdin_source
    }

    pub fn ring(&self) -> MutexGuard<'_, VirtualRing> {
        self.ring.lock().unwrap()
    }

    pub fn stopped(&self) -> StopCode {
        *self.stopped.lock().unwrap()
    }

    fn set_stopped(&self, value: StopCode) {
        *self.stopped.lock().unwrap() = value;
        // Briefly taking the ring lock closes the gap between a waiter's
        // predicate check and its wait; then both sides are woken.
        drop(self.ring.lock().unwrap());
        self.data_available.notify_all();
        self.space_available.notify_all();
    }

    /// Stop the whole session (signal, end timer, stdin EOF).
    pub fn request_terminate(&self) {
        self.set_stopped(StopCode::Terminate);
    }

    /// End the current file but keep listening. No effect unless the
    /// session is currently running.
    pub fn request_end_file(&self) {
        let armed = {
            let mut stopped = self.stopped.lock().unwrap();
            if *stopped == StopCode::Running {
                *stopped = StopCode::EndFile;
                true
            } else {
                false
            }
        };
        if armed {
            drop(self.ring.lock().unwrap());
        }
        self.data_available.notify_all();
    }

    /// Consumer rearm: clear the flag back to `Running` if it still holds
    /// the snapshotted value and is not `Terminate`. A flag that changed
    /// since the snapshot keeps its newer value.
    pub fn rearm(&self, observed: StopCode) -> RearmOutcome {
        let mut stopped = self.stopped.lock().unwrap();
        if *stopped == observed {
            if *stopped == StopCode::Terminate {
                RearmOutcome::KeptTerminate
            } else {
                *stopped = StopCode::Running;
                RearmOutcome::Cleared
            }
        } else {
            RearmOutcome::Changed {
                from: observed.code(),
                to: stopped.code(),
            }
        }
    }

    pub fn file_open(&self) -> bool {
        self.file_open.load(Ordering::Acquire)
    }

    pub fn set_file_open(&self, open: bool) {
        self.file_open.store(open, Ordering::Release);
    }

    pub fn producer_running(&self) -> bool {
        self.producer_running.load(Ordering::Acquire)
    }

    pub fn set_producer_running(&self, running: bool) {
        self.producer_running.store(running, Ordering::Release);
    }

    pub fn fill_stats(&self) -> FillStats {
        self.ring().fill_stats()
    }

    pub fn reset_fill_stats(&self) {
        self.ring().reset_fill_stats();
    }
}

/// Events that drive session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// An OS signal, by number.
    Signal(i32),
    /// The socket readiness wait elapsed without data, or stdin hit EOF.
    IdleTimeout,
    /// Volume milestone: report statistics, no state change.
    Progress,
}

fn signal_name(signo: i32) -> &'static str {
    match signo {
        libc::SIGHUP => "  (HUP)",
        libc::SIGINT => "  (INT)",
        libc::SIGALRM => "  (ALRM)   end_time reached",
        libc::SIGTERM => "  (TERM)",
        _ => "",
    }
}

/// Apply one event to the session: print interval statistics where due and
/// perform the stop transition from the event table.
pub fn deliver_event(
    session: &Session,
    stats: &CaptureStats,
    logger: &Logger,
    event: SessionEvent,
) {
    if let SessionEvent::Signal(signo) = event {
        logger.notice(
            Facility::Signals,
            &format!("caught signal {}{}", signo, signal_name(signo)),
        );
    }

    if event == SessionEvent::IdleTimeout && !session.file_open() {
        // Still waiting for the first packet. Stdin EOF before any data is
        // the end of the session regardless.
        if session.stdin_source() {
            logger.notice(Facility::Session, "no data on stdin");
            session.request_terminate();
        }
        return;
    }

    stats.report_interval(session.fill_stats());

    match event {
        SessionEvent::Signal(signo)
            if signo == libc::SIGINT || signo == libc::SIGTERM || signo == libc::SIGALRM =>
        {
            logger.notice(Facility::Session, "stopping");
            session.request_terminate();
        }
        SessionEvent::Signal(signo) if signo == libc::SIGHUP => {
            session.request_end_file();
        }
        SessionEvent::Signal(_) => {}
        SessionEvent::IdleTimeout => {
            if session.stdin_source() {
                logger.notice(Facility::Session, "no more data on stdin");
                session.request_terminate();
            } else {
                logger.notice(Facility::Session, "timeout");
                session.request_end_file();
            }
        }
        SessionEvent::Progress => {}
    }
}
