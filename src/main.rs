use std::process;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser};

use udprec::capture::Capture;
use udprec::config::{CaptureOptions, Cli};
use udprec::logging::{Facility, Logger};
use udprec::output::{realtime, timestamp_to_str};
use udprec::signals;

fn main() {
    let cli = Cli::parse();

    if cli.help || cli.help_long {
        let mut command = Cli::command();
        let _ = command.print_help();
        if cli.help_long {
            eprintln!("{}", EXTENDED_HELP);
        }
        // Help is not a recorded session.
        process::exit(1);
    }

    if let Err(err) = run(cli) {
        eprintln!("udprec: {:#}", err);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(path) = &cli.path {
        // Also applies to the compressor child, which inherits it.
        std::env::set_var("PATH", path);
    }

    let opts = CaptureOptions::resolve(&cli)?;
    let logger = Logger::for_verbosity(opts.verbose);
    logger.notice(Facility::Session, "starting udprec");

    if opts.verbose {
        logger.debug(Facility::Session, &format!("packlen {}", opts.packlen));
        logger.debug(Facility::Session, &format!("filename {}", opts.filename));
        logger.debug(
            Facility::Session,
            &format!("portlist {}", opts.portlist_label),
        );
        logger.debug(
            Facility::Session,
            &format!("timeout {:.6} sec", opts.timeout.as_secs_f64()),
        );
        if let Some(start) = opts.start_timestamp {
            logger.debug(
                Facility::Session,
                &format!("start time {:.3} = {}", start, timestamp_to_str(start)),
            );
        }
        if let Some(end) = opts.end_timestamp {
            logger.debug(
                Facility::Session,
                &format!("end time   {:.3} = {}", end, timestamp_to_str(end)),
            );
        }
        if let Some(duration) = opts.duration {
            logger.debug(Facility::Session, &format!("duration {:.3} sec", duration));
        }
        if opts.beamformed_check {
            logger.debug(Facility::Session, "check beamformed statistics");
        }
        for (idx, port) in opts.ports.iter().enumerate() {
            logger.debug(Facility::Session, &format!("port {} {}", idx, port));
        }
    }

    let mut capture = Capture::new(opts.clone(), logger.clone())?;

    // Timed session start: the file exists (with the start timestamp in its
    // name) before we wait for the start instant.
    let mut end_timestamp = opts.end_timestamp;
    if let Some(start) = opts.start_timestamp {
        capture.open_initial_file(start)?;
        let wait = start - realtime();
        logger.notice(
            Facility::Session,
            &format!("waiting for {:.3} sec...", wait),
        );
        if wait < 0.0 {
            logger.notice(Facility::Session, "negative wait, starting now!");
            if let Some(duration) = opts.duration {
                end_timestamp = Some(realtime() + duration);
            }
        } else {
            if let Some(duration) = opts.duration {
                end_timestamp = Some(start + duration);
            }
            signals::sleep_until(start);
        }
    } else if let Some(duration) = opts.duration {
        end_timestamp = Some(realtime() + duration);
    }

    signals::block_session_signals()?;

    if let Some(end) = end_timestamp {
        let wait = end - realtime();
        logger.notice(
            Facility::Session,
            &format!("running for max {:.3} sec...", wait),
        );
        if wait < 0.1 {
            bail!(
                "time is{} negative, do not record at all",
                if wait >= 0.0 { " almost" } else { "" }
            );
        }
        signals::arm_end_timer(wait)?;
    }

    let _watcher = signals::spawn_watcher(capture.session(), capture.stats(), logger.clone())?;

    if opts.stdin_mode() {
        logger.notice(Facility::Session, "reading from stdin");
    } else {
        let ports: Vec<String> = opts.ports.iter().map(|p| p.to_string()).collect();
        logger.notice(
            Facility::Session,
            &format!("listening to {}", ports.join(",")),
        );
    }

    capture.run()?;

    logger.notice(Facility::Session, "regular exit");
    Ok(())
}

const EXTENDED_HELP: &str = "\
We can work in different modes. If --Start is given, start at that time,
otherwise with the first arriving packet. If --End is given, stop at that
time. If --duration is given, run for that long, from --Start or from the
first packet. --timeout ends the current recording after that time with no
packets, then waits for the next packet and potentially starts new file(s).
After --duration or at --End, the program stops.

We can listen to several ports, but all data go to one file. --ports 0
reads from stdin; it requires --len and cannot use --Start, --End or
--duration. End of file is treated as timeout.

Filenames are built from --out plus the port list plus the hostname plus
the UTC timestamp. The filename /dev/null (this exact spelling) is used
directly. Packets can be any length unless --len is given, then only that
length is accepted (others discarded). For variable packet lengths the
lengths can be stored as record headers (--sizehead).

Reading and writing have their own threads around a ring buffer
(--bufsize); data are written in blocks of at most --maxwrite bytes, which
should be much smaller than the buffer so space is released early. With
--check the number of received and written packets is compared against the
packet numbers in the beamformed headers to determine completeness. With
--compress the data are piped through the compression command (--compcommand,
which must contain %s for the filename; zstd must be in PATH or --path).";
