// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-port packet accounting and the statistics reports.
//!
//! Counters are written by the producer only; everything else reads them for
//! reporting, so plain relaxed atomics are enough. The interval-snapshot
//! state sits behind a mutex because reports can be triggered from the
//! signal watcher, the producer (volume milestones, idle timeouts) and the
//! consumer (file close).
//!
//! Reports are printed to stdout: they are the observable output of the
//! tool. Everything else goes through the logger to stderr.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ring::FillStats;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Interval reports are due every time this much new volume was enqueued.
pub const PROGRESS_STEP: u64 = 1_000_000_000;

/// Counters for one listening socket (or the stdin pseudo-port).
#[derive(Debug, Default)]
pub struct PortCounters {
    pub port: u16,
    pub packs_seen: AtomicU64,
    pub packs_dropped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub good_packs: AtomicU64,
    /// First observed packet number, -1 until one was seen.
    pub first_packno: AtomicI64,
    pub last_packno: AtomicI64,
}

impl PortCounters {
    fn new(port: u16) -> Self {
        Self {
            port,
            first_packno: AtomicI64::new(-1),
            ..Default::default()
        }
    }

    /// Expected packet count from the observed packet-number span.
    pub fn expected(&self) -> i64 {
        let first = self.first_packno.load(Ordering::Relaxed);
        if first == -1 {
            0
        } else {
            self.last_packno.load(Ordering::Relaxed) - first + 1
        }
    }

    fn reset(&self) {
        self.packs_seen.store(0, Ordering::Relaxed);
        self.packs_dropped.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.good_packs.store(0, Ordering::Relaxed);
        self.first_packno.store(-1, Ordering::Relaxed);
        self.last_packno.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone)]
struct PortSnapshot {
    seen: u64,
    dropped: u64,
    expected: i64,
    good: u64,
}

#[derive(Debug, Default)]
struct IntervalState {
    per_port: Vec<PortSnapshot>,
}

pub struct CaptureStats {
    ports: Vec<PortCounters>,
    beamformed: bool,
    /// Bytes enqueued since the last per-file reset.
    totlen: AtomicU64,
    /// Value of `totlen` at the previous interval report.
    last_totlen: AtomicU64,
    interval: Mutex<IntervalState>,
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part * 100.0 / whole
    }
}

impl CaptureStats {
    pub fn new(ports: &[u16], beamformed: bool) -> Self {
        Self {
            ports: ports.iter().map(|&p| PortCounters::new(p)).collect(),
            beamformed,
            totlen: AtomicU64::new(0),
            last_totlen: AtomicU64::new(0),
            interval: Mutex::new(IntervalState {
                per_port: vec![PortSnapshot::default(); ports.len()],
            }),
        }
    }

    pub fn port(&self, idx: usize) -> &PortCounters {
        &self.ports[idx]
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn totlen(&self) -> u64 {
        self.totlen.load(Ordering::Relaxed)
    }

    pub fn add_totlen(&self, n: u64) {
        self.totlen.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one beamformed header observation for a port.
    pub fn record_beamformed(&self, idx: usize, packno: i64, good: bool) {
        let port = &self.ports[idx];
        port.last_packno.store(packno, Ordering::Relaxed);
        if port.first_packno.load(Ordering::Relaxed) == -1 {
            port.first_packno.store(packno, Ordering::Relaxed);
        }
        if good {
            port.good_packs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True once enqueued volume grew by more than `PROGRESS_STEP` since the
    /// previous interval report.
    pub fn progress_due(&self) -> bool {
        self.totlen.load(Ordering::Relaxed)
            .saturating_sub(self.last_totlen.load(Ordering::Relaxed))
            > PROGRESS_STEP
    }

    /// Periodic statistics dump: totals line plus per-port cumulative and
    /// per-interval figures. Seen/dropped snapshots advance on every call;
    /// the expected/good snapshots only advance when the beamformed block
    /// is printed, so each block line covers exactly the span since the
    /// previous printed report.
    pub fn report_interval(&self, fill: FillStats) {
        let totlen = self.totlen.load(Ordering::Relaxed);
        self.last_totlen.store(totlen, Ordering::Relaxed);
        if totlen > 0 {
            println!(
                "total {:7.3} GB  max buff {}/{} ({:.1} % full)  mean frac {:.3e}\n",
                totlen as f64 / GIB,
                fill.max_fill,
                fill.capacity,
                pct(fill.max_fill as f64, fill.capacity as f64),
                fill.mean_fraction
            );
        }

        let mut interval = self.interval.lock().unwrap();
        for (counters, snap) in self.ports.iter().zip(interval.per_port.iter_mut()) {
            let seen = counters.packs_seen.load(Ordering::Relaxed);
            let dropped = counters.packs_dropped.load(Ordering::Relaxed);
            if totlen > 0 {
                if self.beamformed {
                    let expected = counters.expected();
                    let good = counters.good_packs.load(Ordering::Relaxed);
                    println!(
                        "port {:5} : {:8} exp  {:10.6} % missed  {:10.6} % dropped  {:7.3} GB",
                        counters.port,
                        expected,
                        100.0 - pct(seen as f64, expected as f64),
                        pct(dropped as f64, seen as f64),
                        counters.bytes_written.load(Ordering::Relaxed) as f64 / GIB
                    );
                    println!(
                        "                           {:10.6} % good",
                        pct(good as f64, seen as f64)
                    );
                    let block_expected = expected - snap.expected;
                    let block_seen = seen.saturating_sub(snap.seen);
                    println!(
                        "      block: {:8} exp  {:10.6} % missed  {:10.6} % dropped",
                        block_expected,
                        100.0 - pct(block_seen as f64, block_expected as f64),
                        pct(dropped.saturating_sub(snap.dropped) as f64, block_seen as f64)
                    );
                    println!(
                        "                           {:10.6} % good",
                        pct(good.saturating_sub(snap.good) as f64, block_seen as f64)
                    );
                    snap.expected = expected;
                    snap.good = good;
                } else {
                    println!(
                        "port {:5} : {:8} seen  {:10.6} % dropped  {:7.3} GB",
                        counters.port,
                        seen,
                        pct(dropped as f64, seen as f64),
                        counters.bytes_written.load(Ordering::Relaxed) as f64 / GIB
                    );
                    println!(
                        "      block: {:8} seen  {:10.6} % dropped",
                        seen.saturating_sub(snap.seen),
                        pct(
                            dropped.saturating_sub(snap.dropped) as f64,
                            seen.saturating_sub(snap.seen) as f64
                        )
                    );
                }
            }
            snap.seen = seen;
            snap.dropped = dropped;
        }
    }

    /// Final per-file statistics block. Nothing is printed for a file that
    /// never received a byte.
    pub fn report_final(&self, fill: FillStats) {
        let totlen = self.totlen.load(Ordering::Relaxed);
        if totlen == 0 {
            return;
        }

        println!(
            "\ntotal per socket:  (with{} checks for beamformed data)",
            if self.beamformed { "" } else { "out" }
        );
        for counters in &self.ports {
            let seen = counters.packs_seen.load(Ordering::Relaxed);
            let dropped = counters.packs_dropped.load(Ordering::Relaxed);
            let written = seen - dropped;
            let volume = counters.bytes_written.load(Ordering::Relaxed) as f64 / GIB;
            if self.beamformed {
                let expected = counters.expected();
                let good = counters.good_packs.load(Ordering::Relaxed);
                let missed = expected - seen as i64;
                println!("port {:5} :  expected packets {:9}", counters.port, expected);
                println!(
                    "                missed packets {:9}   {:10.6} % of exp",
                    missed,
                    pct(missed as f64, expected as f64)
                );
                println!(
                    "                  seen packets {:9}   {:10.6} % of exp",
                    seen,
                    pct(seen as f64, expected as f64)
                );
                println!(
                    "                  good packets {:9}   {:10.6} % of seen",
                    good,
                    pct(good as f64, seen as f64)
                );
                println!(
                    "               dropped packets {:9}   {:10.6} % of seen",
                    dropped,
                    pct(dropped as f64, seen as f64)
                );
                println!(
                    "               written packets {:9}   {:10.6} % of seen",
                    written,
                    pct(written as f64, seen as f64)
                );
                println!(
                    "                                           {:10.6} % of exp",
                    pct(written as f64, expected as f64)
                );
                println!("                       volume    {:7.3} GB", volume);
            } else {
                println!("port {:5} :  seen packets {:9}", counters.port, seen);
                println!(
                    "           dropped packets {:9}   {:10.6} % of seen",
                    dropped,
                    pct(dropped as f64, seen as f64)
                );
                println!(
                    "           written packets {:9}   {:10.6} % of seen",
                    written,
                    pct(written as f64, seen as f64)
                );
                println!("                   volume    {:7.3} GB", volume);
            }
        }

        println!(
            "\ntotal {:7.3} GB  max buff {}/{} ({:.1} % full)  mean frac {:.3e}",
            totlen as f64 / GIB,
            fill.max_fill,
            fill.capacity,
            pct(fill.max_fill as f64, fill.capacity as f64),
            fill.mean_fraction
        );
    }

    /// Reset every per-file counter: called after the final statistics of a
    /// closing file so the next file starts from zero.
    pub fn reset_for_new_file(&self) {
        for counters in &self.ports {
            counters.reset();
        }
        let mut interval = self.interval.lock().unwrap();
        for snap in interval.per_port.iter_mut() {
            *snap = PortSnapshot::default();
        }
        self.totlen.store(0, Ordering::Relaxed);
        self.last_totlen.store(0, Ordering::Relaxed);
    }
}
