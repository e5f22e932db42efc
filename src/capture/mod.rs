//! Pipeline assembly: ring + session + producer + consumer, and the thread
//! lifecycle around them.

mod consumer;
mod producer;

pub use consumer::Consumer;
pub use producer::{PacketSource, Producer};

use std::io::Read;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::CaptureOptions;
use crate::logging::{Facility, Logger};
use crate::output::FileNamer;
use crate::ring::VirtualRing;
use crate::session::Session;
use crate::stats::CaptureStats;

/// Kernel receive buffer requested per capture socket.
const RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Grace period for the producer after the consumer finished.
const PRODUCER_GRACE: Duration = Duration::from_secs(1);

pub struct Capture {
    opts: CaptureOptions,
    logger: Logger,
    session: Arc<Session>,
    stats: Arc<CaptureStats>,
    producer: Option<Producer>,
    consumer: Option<Consumer>,
}

/// Bind one capture socket with a large receive buffer.
fn bind_capture_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating capture socket")?;
    socket
        .set_recv_buffer_size(RECV_BUFFER_SIZE)
        .context("setting receive buffer size")?;
    let addr = std::net::SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding UDP port {}", port))?;
    Ok(socket.into())
}

fn hostname(logger: &Logger) -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            logger.warning(
                Facility::Network,
                &format!("cannot determine hostname, using unknown: {}", err),
            );
            "unknown".to_string()
        }
    }
}

impl Capture {
    /// Build the pipeline with real sources: bound sockets, or the process
    /// standard input in stdin mode.
    pub fn new(opts: CaptureOptions, logger: Logger) -> Result<Self> {
        let source = if opts.stdin_mode() {
            PacketSource::Stream(Box::new(std::io::stdin()))
        } else {
            let sockets = opts
                .ports
                .iter()
                .map(|&port| bind_capture_socket(port))
                .collect::<Result<Vec<_>>>()?;
            PacketSource::Sockets(sockets)
        };
        Self::with_source(opts, logger, source)
    }

    /// Build the pipeline around an arbitrary record source. Used by the
    /// stdin-mode tests; `Capture::new` goes through here too.
    pub fn with_source(
        opts: CaptureOptions,
        logger: Logger,
        source: PacketSource,
    ) -> Result<Self> {
        let ring = VirtualRing::with_min_size(opts.bufsize)?;
        logger.debug(
            Facility::Ring,
            &format!("ring buffer capacity {} bytes", ring.capacity()),
        );
        let session = Session::new(ring, opts.stdin_mode());
        let stats = Arc::new(CaptureStats::new(&opts.ports, opts.beamformed_check));

        let producer = Producer {
            session: Arc::clone(&session),
            stats: Arc::clone(&stats),
            logger: logger.clone(),
            source,
            packlen: opts.packlen,
            sizehead: opts.sizehead,
            beamformed_check: opts.beamformed_check,
            timeout: opts.timeout,
            verbose: opts.verbose,
        };

        let namer = FileNamer {
            base: opts.filename.clone(),
            portlist: opts.portlist_label.clone(),
            hostname: hostname(&logger),
            compress: opts.compress,
        };
        let consumer = Consumer {
            session: Arc::clone(&session),
            stats: Arc::clone(&stats),
            logger: logger.clone(),
            namer,
            packlen: opts.packlen,
            maxwrite: opts.maxwrite,
            maxfilesize: opts.maxfilesize,
            stats_per_splitfile: opts.stats_per_splitfile,
            compress: opts.compress,
            compcommand: opts.compcommand.clone(),
            sink: None,
            filenumber: if opts.maxfilesize > 0 { 0 } else { -1 },
            bytes_written_thisfile: 0,
            last_timestamp: 0.0,
        };

        Ok(Self {
            opts,
            logger,
            session,
            stats,
            producer: Some(producer),
            consumer: Some(consumer),
        })
    }

    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.opts
    }

    /// Open the first output file ahead of the recording (timed start).
    pub fn open_initial_file(&mut self, timestamp: f64) -> Result<()> {
        self.consumer
            .as_mut()
            .expect("pipeline already running")
            .open_initial(timestamp)
    }

    /// Run the pipeline to completion: spawn both workers, join the
    /// consumer, then give the producer a grace period. A producer still
    /// blocked afterwards (stdin read, readiness wait) is abandoned and
    /// reaped by process exit.
    pub fn run(mut self) -> Result<()> {
        let producer = self.producer.take().expect("pipeline already running");
        let consumer = self.consumer.take().expect("pipeline already running");

        let consumer_handle = thread::Builder::new()
            .name("consumer".into())
            .spawn(move || consumer.run())
            .context("spawning consumer thread")?;
        let producer_handle = thread::Builder::new()
            .name("producer".into())
            .spawn(move || producer.run())
            .context("spawning producer thread")?;

        let consumer_result = consumer_handle
            .join()
            .map_err(|_| anyhow::anyhow!("consumer thread panicked"))?;
        consumer_result?;

        let deadline = std::time::Instant::now() + PRODUCER_GRACE;
        while self.session.producer_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if self.session.producer_running() {
            self.logger.debug(
                Facility::Session,
                "producer still blocked after grace period, abandoning it",
            );
            drop(producer_handle);
        } else {
            producer_handle
                .join()
                .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
        }
        Ok(())
    }
}

/// Wrap any reader as a record source without naming the trait object at
/// the call site.
pub fn reader_source<R: Read + Send + 'static>(reader: R) -> PacketSource {
    PacketSource::Stream(Box::new(reader))
}
