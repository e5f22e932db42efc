//! Ingress: turns socket readiness (or stdin) into whole-record commits
//! into the ring buffer, tracking per-port counters along the way.

use std::io::{ErrorKind, Read};
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::logging::{Facility, Logger};
use crate::packet::BeamHeader;
use crate::session::{deliver_event, Session, SessionEvent, StopCode};
use crate::stats::CaptureStats;
use crate::MAX_DATAGRAM;

/// Where datagrams come from: bound sockets, or a byte stream standing in
/// for the single stdin pseudo-port.
pub enum PacketSource {
    Sockets(Vec<UdpSocket>),
    Stream(Box<dyn Read + Send>),
}

pub struct Producer {
    pub(crate) session: Arc<Session>,
    pub(crate) stats: Arc<CaptureStats>,
    pub(crate) logger: Logger,
    pub(crate) source: PacketSource,
    pub(crate) packlen: usize,
    pub(crate) sizehead: bool,
    pub(crate) beamformed_check: bool,
    pub(crate) timeout: Duration,
    pub(crate) verbose: bool,
}

impl Producer {
    pub fn run(mut self) -> Result<()> {
        self.session.set_producer_running(true);
        let result = self.run_inner();
        if let Err(err) = &result {
            // A dead producer must take the session down with it, or the
            // consumer would wait for data forever.
            self.logger
                .error(Facility::Ingress, &format!("producer failed: {:#}", err));
            self.session.request_terminate();
        }
        self.session.set_producer_running(false);
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        // The first two bytes are reserved for the optional length prefix;
        // the datagram itself lands right behind them, so prefix + payload
        // are always one contiguous region.
        let mut staging = vec![0u8; MAX_DATAGRAM + 2];
        let payload_off = if self.sizehead { 2 } else { 0 };

        loop {
            if self.stats.progress_due() {
                deliver_event(
                    &self.session,
                    &self.stats,
                    &self.logger,
                    SessionEvent::Progress,
                );
            }

            match &mut self.source {
                PacketSource::Stream(_) => {
                    if self.session.stopped() == StopCode::Terminate {
                        self.logger
                            .debug(Facility::Ingress, "stop observed, stdin reader exiting");
                        return Ok(());
                    }
                    self.step_stream(&mut staging, payload_off)?;
                }
                PacketSource::Sockets(_) => {
                    if self.session.stopped() == StopCode::Terminate {
                        self.logger
                            .debug(Facility::Ingress, "stop observed, closing sockets");
                        self.source = PacketSource::Sockets(Vec::new());
                        return Ok(());
                    }
                    self.step_sockets(&mut staging, payload_off)?;
                }
            }
        }
    }

    /// One readiness round over all sockets.
    fn step_sockets(&mut self, staging: &mut [u8], payload_off: usize) -> Result<()> {
        let sockets = match &self.source {
            PacketSource::Sockets(sockets) => sockets,
            PacketSource::Stream(_) => unreachable!("socket step on stream source"),
        };

        let mut fds: Vec<libc::pollfd> = sockets
            .iter()
            .map(|socket| libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = self.timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: fds points at a live array of fds.len() pollfd entries.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            return Err(std::io::Error::last_os_error()).context("poll() over capture sockets");
        }
        if ready == 0 {
            deliver_event(
                &self.session,
                &self.stats,
                &self.logger,
                SessionEvent::IdleTimeout,
            );
            return Ok(());
        }

        for (idx, fd) in fds.iter().enumerate() {
            if fd.revents & libc::POLLIN == 0 {
                continue;
            }
            let (size, _peer) = sockets[idx]
                .recv_from(&mut staging[payload_off..payload_off + MAX_DATAGRAM - 1])
                .context("recv_from() in producer")?;
            if size > 0 {
                self.accept(idx, staging, size, payload_off);
            }
        }
        Ok(())
    }

    /// One record from the byte stream. Stdin is never dropped: wait for
    /// ring space before reading.
    fn step_stream(&mut self, staging: &mut [u8], payload_off: usize) -> Result<()> {
        let record_len = self.packlen + payload_off;
        {
            let mut ring = self.session.ring();
            while ring.write_view(record_len).is_none() {
                ring = self.session.space_available.wait(ring).unwrap();
            }
        }

        let reader = match &mut self.source {
            PacketSource::Stream(reader) => reader,
            PacketSource::Sockets(_) => unreachable!("stream step on socket source"),
        };
        let want = self.packlen;
        match read_record(reader.as_mut(), &mut staging[payload_off..payload_off + want]) {
            Ok(0) => {
                // EOF behaves like an idle timeout.
                deliver_event(
                    &self.session,
                    &self.stats,
                    &self.logger,
                    SessionEvent::IdleTimeout,
                );
            }
            Ok(size) => self.accept(0, staging, size, payload_off),
            Err(err) => {
                self.logger.error(
                    Facility::Ingress,
                    &format!("reading from stdin in producer: {}", err),
                );
                deliver_event(
                    &self.session,
                    &self.stats,
                    &self.logger,
                    SessionEvent::IdleTimeout,
                );
            }
        }
        Ok(())
    }

    /// Acceptance policy and enqueue for one received record. `size` bytes
    /// sit at `staging[payload_off..]`.
    fn accept(&self, idx: usize, staging: &mut [u8], size: usize, payload_off: usize) {
        if self.session.stopped() == StopCode::Terminate {
            // Received but already winding down.
            if self.verbose {
                self.logger.debug(Facility::Ingress, "discarding packet");
            }
            return;
        }

        if self.packlen > 0 && size != self.packlen {
            self.logger.warning(
                Facility::Ingress,
                &format!(
                    "received {:5} bytes, wrong length on port index {}, should be {}",
                    size, idx, self.packlen
                ),
            );
            return;
        }

        if self.beamformed_check {
            if let Some(header) = BeamHeader::parse(&staging[payload_off..payload_off + size]) {
                self.stats
                    .record_beamformed(idx, header.packno(), header.is_good());
            }
        }

        let port = self.stats.port(idx);
        port.packs_seen
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let record_len = size + payload_off;
        if self.sizehead {
            staging[0..2].copy_from_slice(&(size as u16).to_le_bytes());
        }

        let view = {
            let mut ring = self.session.ring();
            let view = ring.write_view(record_len);
            ring.note_fill_sample();
            view
        };

        match view {
            None => {
                port.packs_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Some(dst) => {
                // SAFETY: the view spans record_len reserved bytes that the
                // consumer will not touch before commit_write publishes them.
                unsafe { ptr::copy_nonoverlapping(staging.as_ptr(), dst, record_len) };
                {
                    let mut ring = self.session.ring();
                    ring.commit_write(record_len);
                }
                self.session.data_available.notify_all();
                self.stats.add_totlen(record_len as u64);
                port.bytes_written
                    .fetch_add(record_len as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }
}

/// Read exactly `buf.len()` bytes unless the stream ends first; returns the
/// number of bytes actually read (0 at clean EOF).
fn read_record(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_record_exact() {
        let data = vec![7u8; 100];
        let mut reader: &[u8] = &data;
        let mut buf = [0u8; 40];
        assert_eq!(read_record(&mut reader, &mut buf).unwrap(), 40);
        assert_eq!(read_record(&mut reader, &mut buf).unwrap(), 40);
        assert_eq!(read_record(&mut reader, &mut buf).unwrap(), 20);
        assert_eq!(read_record(&mut reader, &mut buf).unwrap(), 0);
    }
}
