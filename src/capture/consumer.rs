//! Egress: drains the ring to the active sink in bounded chunks and runs
//! the file lifecycle (open on first data, split at size, close on session
//! transitions, final statistics at every close).

use std::slice;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::logging::{Facility, Logger};
use crate::output::{realtime, FileNamer, OutputSink};
use crate::session::{RearmOutcome, Session, StopCode};
use crate::stats::CaptureStats;

pub struct Consumer {
    pub(crate) session: Arc<Session>,
    pub(crate) stats: Arc<CaptureStats>,
    pub(crate) logger: Logger,
    pub(crate) namer: FileNamer,
    pub(crate) packlen: usize,
    pub(crate) maxwrite: usize,
    /// Split threshold, 0 = no limit.
    pub(crate) maxfilesize: u64,
    pub(crate) stats_per_splitfile: bool,
    pub(crate) compress: bool,
    pub(crate) compcommand: String,
    pub(crate) sink: Option<OutputSink>,
    /// Current file number; -1 means unnumbered filenames.
    pub(crate) filenumber: i64,
    pub(crate) bytes_written_thisfile: u64,
    pub(crate) last_timestamp: f64,
}

impl Consumer {
    /// Open the very first file ahead of time (timed session start: the
    /// filename carries the start timestamp, not the first-packet time).
    pub fn open_initial(&mut self, timestamp: f64) -> Result<()> {
        self.open_sink(Some(timestamp))
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            if self.step()? {
                return Ok(());
            }
        }
    }

    /// One consumer round. Returns true when the session is over.
    fn step(&mut self) -> Result<bool> {
        let has_data = {
            let mut ring = self.session.ring();
            while ring.read_view().is_none() && self.session.stopped() == StopCode::Running {
                ring = self.session.data_available.wait(ring).unwrap();
            }
            ring.read_view().is_some()
        };

        // The shared flag may keep changing; every decision below uses this
        // snapshot, plus a local working copy for the split state.
        let observed = self.session.stopped();
        let mut local = observed;

        if local == StopCode::Running
            && self.maxfilesize > 0
            && self.bytes_written_thisfile >= self.maxfilesize
        {
            local = StopCode::Split;
        }

        if self.sink.is_some()
            && ((local == StopCode::Terminate && !has_data)
                || local == StopCode::EndFile
                || local == StopCode::Split)
        {
            if local != StopCode::Split || self.stats_per_splitfile {
                self.stats.report_final(self.session.fill_stats());
                self.stats.reset_for_new_file();
                self.session.reset_fill_stats();
            }
            self.close_sink(local == StopCode::Split)?;
            if local == StopCode::Split {
                debug_assert!(self.filenumber >= 0);
                // Same base timestamp, next number.
                self.open_sink(None)?;
            }
        }

        if local == StopCode::Terminate && !has_data {
            self.logger
                .debug(Facility::Egress, "stop observed with empty buffer, consumer exiting");
            return Ok(true);
        }

        match self.session.rearm(observed) {
            RearmOutcome::Cleared | RearmOutcome::KeptTerminate => {}
            RearmOutcome::Changed { from, to } => {
                self.logger.warning(
                    Facility::Session,
                    &format!(
                        "stopped status changed from {} to {} while setting local stop to {}",
                        from,
                        to,
                        local.code()
                    ),
                );
            }
        }

        if !has_data {
            return Ok(false);
        }

        if self.sink.is_none() {
            // New recording: numbered sequences restart at 0.
            if self.filenumber > 0 {
                self.filenumber = 0;
            }
            self.open_sink(Some(realtime()))?;
        }

        self.drain_chunk()
    }

    /// Write one bounded chunk from the ring to the sink.
    fn drain_chunk(&mut self) -> Result<bool> {
        let (ptr, available) = {
            let ring = self.session.ring();
            match ring.read_view() {
                Some(ptr) => (ptr, ring.fill()),
                None => return Ok(false),
            }
        };

        let mut len = available.min(self.maxwrite);
        if self.packlen > 0 {
            // Only flush whole records; a record may be wider than packlen
            // (length prefix), so never round down to nothing.
            let rounded = (len / self.packlen) * self.packlen;
            if rounded > 0 {
                len = rounded;
            }
        }
        if self.maxfilesize > 0 {
            // Stop exactly at the split threshold; the next round reopens.
            let remaining = self.maxfilesize.saturating_sub(self.bytes_written_thisfile);
            len = len.min(remaining as usize);
            if len == 0 {
                return Ok(false);
            }
        }

        // SAFETY: `len <= fill`, and the producer never touches
        // [front, front + fill) before commit_read releases it.
        let chunk = unsafe { slice::from_raw_parts(ptr, len) };
        let sink = self
            .sink
            .as_mut()
            .expect("drain with no open sink");
        sink.write_all(chunk).context("writing capture file")?;
        self.bytes_written_thisfile += len as u64;

        {
            let mut ring = self.session.ring();
            ring.commit_read(len);
        }
        self.session.space_available.notify_all();
        Ok(false)
    }

    fn open_sink(&mut self, timestamp: Option<f64>) -> Result<()> {
        let timestamp = match timestamp {
            Some(ts) => {
                self.last_timestamp = ts;
                ts
            }
            None => self.last_timestamp,
        };
        self.logger.notice(
            Facility::Egress,
            if self.compress {
                "start compression pipe"
            } else {
                "start file"
            },
        );

        let number = if self.filenumber >= 0 {
            Some(self.filenumber as u32)
        } else {
            None
        };
        let path = self.namer.build(timestamp, number);
        if self.filenumber >= 0 {
            self.filenumber += 1;
        }

        self.logger
            .notice(Facility::Egress, &format!("creating {}", path));
        let sink = if self.compress {
            OutputSink::open_pipe(&self.compcommand, &path)
        } else {
            OutputSink::open_file(&path)
        }
        .with_context(|| format!("opening output {}", path))?;

        self.sink = Some(sink);
        self.bytes_written_thisfile = 0;
        self.session.set_file_open(true);
        Ok(())
    }

    fn close_sink(&mut self, split: bool) -> Result<()> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        self.logger.notice(
            Facility::Egress,
            &format!(
                "closing {}{}",
                sink.path(),
                if split { "  (split file)" } else { "" }
            ),
        );
        let compressed = sink.close().context("closing output")?;
        if let Some(len) = compressed {
            let raw = self.bytes_written_thisfile;
            let ratio = if raw == 0 {
                0.0
            } else {
                len as f64 / raw as f64 * 100.0
            };
            self.logger.notice(
                Facility::Egress,
                &format!("compression: {} -> {}  reduced to {:.3} %", raw, len, ratio),
            );
        }
        self.session.set_file_open(false);
        Ok(())
    }
}
