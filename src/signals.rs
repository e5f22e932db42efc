//! Signal handling and session timers.
//!
//! All capture threads run with the session signals blocked; a dedicated
//! watcher thread waits for them synchronously and performs the state
//! transitions with ordinary locks. Nothing runs in async-signal context.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};

use crate::logging::{Facility, Logger};
use crate::output::realtime;
use crate::session::{deliver_event, Session, SessionEvent};
use crate::stats::CaptureStats;

const SESSION_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGALRM,
];

fn session_sigset() -> SigSet {
    let mut set = SigSet::empty();
    for signal in SESSION_SIGNALS {
        set.add(signal);
    }
    set
}

/// Block the session signals in the calling thread. Must run before the
/// worker threads are spawned so they inherit the mask and the watcher is
/// the only receiver.
pub fn block_session_signals() -> Result<()> {
    session_sigset()
        .thread_block()
        .context("blocking session signals")
}

/// Spawn the watcher thread: waits for session signals and applies the
/// corresponding transitions. Exits after a terminating signal.
pub fn spawn_watcher(
    session: Arc<Session>,
    stats: Arc<CaptureStats>,
    logger: Logger,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let set = session_sigset();
            loop {
                match set.wait() {
                    Ok(signal) => {
                        deliver_event(
                            &session,
                            &stats,
                            &logger,
                            SessionEvent::Signal(signal as i32),
                        );
                        if matches!(
                            signal,
                            Signal::SIGINT | Signal::SIGTERM | Signal::SIGALRM
                        ) {
                            return;
                        }
                    }
                    Err(err) => {
                        logger.error(
                            Facility::Signals,
                            &format!("waiting for signals: {}", err),
                        );
                        return;
                    }
                }
            }
        })
        .context("spawning signal watcher")
}

/// Arm the one-shot end-of-session timer: SIGALRM after `seconds`.
pub fn arm_end_timer(seconds: f64) -> Result<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: seconds as libc::time_t,
            tv_usec: ((seconds - seconds.floor()) * 1e6 + 0.5) as libc::suseconds_t,
        },
    };
    // SAFETY: plain syscall with a valid itimerval.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("setitimer()");
    }
    Ok(())
}

/// Sleep until the given wall-clock timestamp.
pub fn sleep_until(target: f64) {
    loop {
        let wait = target - realtime();
        if wait <= 0.0 {
            return;
        }
        thread::sleep(Duration::from_secs_f64(wait.min(1.0)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigset_contains_session_signals() {
        let set = session_sigset();
        for signal in SESSION_SIGNALS {
            assert!(set.contains(signal));
        }
        assert!(!set.contains(Signal::SIGUSR1));
    }

    #[test]
    fn test_sleep_until_past_target_returns() {
        sleep_until(realtime() - 10.0);
    }
}
