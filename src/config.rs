// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Capture options: CLI surface, grammars, and validation.

use clap::Parser;
use std::time::Duration;
use thiserror::Error;

use crate::packet::BEAM_PACKET_LEN;
use crate::{MAX_DATAGRAM, MAX_PORTS};

/// Default compression pipeline; `%s` is replaced by the output filename.
pub const DEFAULT_COMPCOMMAND: &str =
    "zstd -1 --zstd='strategy=0,wlog=13,hlog=7,slog=1,slen=7' -q -f -T2 -o %s";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
pub struct Cli {
    /// UDP ports to record, e.g. 31664,31665 or 31664x2; 0 reads stdin
    #[arg(long, short = 'p', default_value = "4346")]
    pub ports: String,

    /// Output filename base; /dev/null is used verbatim
    #[arg(long, short = 'o', default_value = "udp")]
    pub out: String,

    /// Fixed packet length; other sizes are discarded. Default: any length
    #[arg(long, short = 'l')]
    pub len: Option<i64>,

    /// Prepend each stored record with its 16-bit little-endian length
    #[arg(long, short = 's')]
    pub sizehead: bool,

    /// Packet statistics for beamformed data; implies --len 7824
    #[arg(long, short = 'c')]
    pub check: bool,

    /// Idle timeout in seconds
    #[arg(long, short = 't', default_value_t = 10.0)]
    pub timeout: f64,

    /// Recording start, unix seconds or yyyy-mm-ddThh:mm:ss. Default: now
    #[arg(long = "Start", short = 'S')]
    pub start: Option<String>,

    /// Recording end, same grammar as --Start. Default: never
    #[arg(long = "End", short = 'E')]
    pub end: Option<String>,

    /// Recording duration in seconds, from --Start or from the first packet
    #[arg(long, short = 'd')]
    pub duration: Option<f64>,

    /// Split files at this size (bytes before compression);
    /// positive: statistics per file, negative: combined
    #[arg(long = "Maxfilesize", short = 'M', allow_hyphen_values = true)]
    pub maxfilesize: Option<f64>,

    /// Ring buffer size in bytes (float accepted)
    #[arg(long, short = 'b', default_value_t = 104_857_600.0)]
    pub bufsize: f64,

    /// Maximum write block handed to the file sink
    #[arg(long, short = 'm', default_value_t = 1_048_576)]
    pub maxwrite: i64,

    /// Compress on the fly through the compression command
    #[arg(long, short = 'z')]
    pub compress: bool,

    /// Compression command; must contain %s for the filename
    #[arg(long = "compcommand", short = 'Z')]
    pub compcommand: Option<String>,

    /// PATH override, e.g. for locating the compression command
    #[arg(long = "path", short = 'P')]
    pub path: Option<String>,

    /// Additional startup logging
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Brief help
    #[arg(long, short = 'h')]
    pub help: bool,

    /// Extended help
    #[arg(long = "Help", short = 'H')]
    pub help_long: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("problem with packet length")]
    PacketLen,
    #[error("problem with bufsize")]
    BufSize,
    #[error("problem with maxwrite")]
    MaxWrite,
    #[error("problem with timeout")]
    Timeout,
    #[error("problem with start time")]
    StartTime,
    #[error("problem with end time")]
    EndTime,
    #[error("problem with duration")]
    Duration,
    #[error("problem with Maxfilesize")]
    MaxFileSize,
    #[error("cannot use --End and --duration together")]
    EndAndDuration,
    #[error("--check implies --len 7824, cannot use other value")]
    CheckLen,
    #[error("compression command must include '%s' for the filename")]
    CompCommand,
    #[error("invalid port list entry '{0}'")]
    PortEntry(String),
    #[error("number of sockets too large ({0}, allowed max. {1})")]
    PortCount(usize, usize),
    #[error("port 0 (stdin) cannot be combined with other ports")]
    StdinMix,
    #[error("reading from stdin requires --len")]
    StdinNeedsLen,
    #[error("reading from stdin is not compatible with --Start, --End, --duration")]
    StdinTimes,
}

/// Fully validated capture options.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub ports: Vec<u16>,
    /// The port list exactly as given; becomes part of the filename.
    pub portlist_label: String,
    pub filename: String,
    /// Fixed packet length, 0 = accept any size.
    pub packlen: usize,
    pub sizehead: bool,
    pub beamformed_check: bool,
    pub timeout: Duration,
    pub start_timestamp: Option<f64>,
    pub end_timestamp: Option<f64>,
    pub duration: Option<f64>,
    /// Split threshold in bytes, 0 = no limit.
    pub maxfilesize: u64,
    pub stats_per_splitfile: bool,
    pub bufsize: usize,
    pub maxwrite: usize,
    pub compress: bool,
    pub compcommand: String,
    pub verbose: bool,
}

impl CaptureOptions {
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut packlen = match cli.len {
            None => 0usize,
            Some(l) if l > 0 && (l as usize) < MAX_DATAGRAM => l as usize,
            Some(_) => return Err(ConfigError::PacketLen),
        };
        if cli.check {
            if packlen != 0 && packlen != BEAM_PACKET_LEN {
                return Err(ConfigError::CheckLen);
            }
            packlen = BEAM_PACKET_LEN;
        }

        if !(cli.bufsize > 1e4 && cli.bufsize <= 16e9) {
            return Err(ConfigError::BufSize);
        }
        if cli.maxwrite <= 1024 {
            return Err(ConfigError::MaxWrite);
        }
        if !(cli.timeout >= 1e-3) {
            return Err(ConfigError::Timeout);
        }

        let start_timestamp = match &cli.start {
            None => None,
            Some(s) => Some(parse_time(s).ok_or(ConfigError::StartTime)?),
        };
        let end_timestamp = match &cli.end {
            None => None,
            Some(s) => Some(parse_time(s).ok_or(ConfigError::EndTime)?),
        };
        let duration = match cli.duration {
            None => None,
            Some(d) if d > 0.0 => Some(d),
            Some(_) => return Err(ConfigError::Duration),
        };
        if end_timestamp.is_some() && duration.is_some() {
            return Err(ConfigError::EndAndDuration);
        }

        let (maxfilesize, stats_per_splitfile) = match cli.maxfilesize {
            None => (0u64, true),
            Some(m) if m == 0.0 || !m.is_finite() => return Err(ConfigError::MaxFileSize),
            Some(m) => (m.abs() as u64, m > 0.0),
        };

        let compcommand = cli
            .compcommand
            .clone()
            .unwrap_or_else(|| DEFAULT_COMPCOMMAND.to_string());
        if !compcommand.contains("%s") {
            return Err(ConfigError::CompCommand);
        }

        let ports = parse_port_list(&cli.ports)?;
        let stdin_mode = ports.len() == 1 && ports[0] == 0;
        if stdin_mode {
            if packlen == 0 {
                return Err(ConfigError::StdinNeedsLen);
            }
            if start_timestamp.is_some() || end_timestamp.is_some() || duration.is_some() {
                return Err(ConfigError::StdinTimes);
            }
        }

        Ok(Self {
            ports,
            portlist_label: cli.ports.clone(),
            filename: cli.out.clone(),
            packlen,
            sizehead: cli.sizehead,
            beamformed_check: cli.check,
            timeout: Duration::from_secs_f64(cli.timeout),
            start_timestamp,
            end_timestamp,
            duration,
            maxfilesize,
            stats_per_splitfile,
            bufsize: cli.bufsize as usize,
            maxwrite: cli.maxwrite as usize,
            compress: cli.compress,
            compcommand,
            verbose: cli.verbose,
        })
    }

    /// One pseudo-port reading the process standard input.
    pub fn stdin_mode(&self) -> bool {
        self.ports.len() == 1 && self.ports[0] == 0
    }
}

/// Parse a port list: comma-separated entries, each either a port number or
/// `NxK` for K consecutive ports starting at N.
pub fn parse_port_list(list: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    for entry in list.split(',') {
        let bad = || ConfigError::PortEntry(entry.to_string());
        if let Some((base, count)) = entry.split_once('x') {
            let base: u16 = base.parse().map_err(|_| bad())?;
            let count: u16 = count.parse().map_err(|_| bad())?;
            if count == 0 {
                return Err(bad());
            }
            for k in 0..count {
                ports.push(base.checked_add(k).ok_or_else(bad)?);
            }
        } else {
            ports.push(entry.parse().map_err(|_| bad())?);
        }
    }
    if ports.is_empty() {
        return Err(ConfigError::PortEntry(list.to_string()));
    }
    if ports.len() > MAX_PORTS {
        return Err(ConfigError::PortCount(ports.len(), MAX_PORTS));
    }
    if ports.contains(&0) && ports.len() > 1 {
        return Err(ConfigError::StdinMix);
    }
    Ok(ports)
}

/// Parse a point in time: either unix seconds or `yyyy-mm-ddThh:mm:ss`
/// (interpreted as UTC).
pub fn parse_time(time: &str) -> Option<f64> {
    if time.contains('T') {
        chrono::NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|dt| dt.and_utc().timestamp() as f64)
    } else {
        time.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["udprec"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_port_list_single_and_csv() {
        assert_eq!(parse_port_list("4346").unwrap(), vec![4346]);
        assert_eq!(
            parse_port_list("16011,16012,16013").unwrap(),
            vec![16011, 16012, 16013]
        );
    }

    #[test]
    fn test_port_list_repeat_grammar() {
        assert_eq!(
            parse_port_list("31664x4").unwrap(),
            vec![31664, 31665, 31666, 31667]
        );
        assert_eq!(
            parse_port_list("100x2,200").unwrap(),
            vec![100, 101, 200]
        );
    }

    #[test]
    fn test_port_list_rejects_garbage() {
        assert!(parse_port_list("").is_err());
        assert!(parse_port_list("abc").is_err());
        assert!(parse_port_list("12x").is_err());
        assert!(parse_port_list("12x0").is_err());
        assert!(parse_port_list("70000").is_err());
        assert!(parse_port_list("65535x2").is_err());
    }

    #[test]
    fn test_port_list_limits() {
        assert_eq!(parse_port_list("1000x12").unwrap().len(), 12);
        assert_eq!(
            parse_port_list("1000x13"),
            Err(ConfigError::PortCount(13, MAX_PORTS))
        );
        assert_eq!(parse_port_list("0,5000"), Err(ConfigError::StdinMix));
    }

    #[test]
    fn test_time_grammar() {
        assert_eq!(parse_time("1543384831"), Some(1_543_384_831.0));
        assert_eq!(parse_time("2018-11-28T06:00:31"), Some(1_543_384_831.0));
        assert_eq!(parse_time("2018-11-28T06:00"), None);
        assert_eq!(parse_time("half past ten"), None);
        assert_eq!(parse_time("-5"), None);
    }

    #[test]
    fn test_defaults_resolve() {
        let opts = CaptureOptions::resolve(&cli(&[])).unwrap();
        assert_eq!(opts.ports, vec![4346]);
        assert_eq!(opts.filename, "udp");
        assert_eq!(opts.packlen, 0);
        assert_eq!(opts.bufsize, 104_857_600);
        assert_eq!(opts.maxwrite, 1_048_576);
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.maxfilesize, 0);
        assert!(opts.stats_per_splitfile);
        assert_eq!(opts.compcommand, DEFAULT_COMPCOMMAND);
        assert!(!opts.stdin_mode());
    }

    #[test]
    fn test_check_forces_beam_packet_len() {
        let opts = CaptureOptions::resolve(&cli(&["--check"])).unwrap();
        assert_eq!(opts.packlen, BEAM_PACKET_LEN);
        assert!(opts.beamformed_check);

        let opts = CaptureOptions::resolve(&cli(&["--check", "--len", "7824"])).unwrap();
        assert_eq!(opts.packlen, BEAM_PACKET_LEN);

        assert_eq!(
            CaptureOptions::resolve(&cli(&["--check", "--len", "512"])),
            Err(ConfigError::CheckLen)
        );
    }

    #[test]
    fn test_range_checks() {
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--len", "0"])),
            Err(ConfigError::PacketLen)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--len", "10000"])),
            Err(ConfigError::PacketLen)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--bufsize", "100"])),
            Err(ConfigError::BufSize)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--bufsize", "2e10"])),
            Err(ConfigError::BufSize)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--maxwrite", "1024"])),
            Err(ConfigError::MaxWrite)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--timeout", "0"])),
            Err(ConfigError::Timeout)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--duration", "0"])),
            Err(ConfigError::Duration)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--Maxfilesize", "0"])),
            Err(ConfigError::MaxFileSize)
        );
    }

    #[test]
    fn test_maxfilesize_sign_selects_stats_mode() {
        let opts = CaptureOptions::resolve(&cli(&["--Maxfilesize", "100000"])).unwrap();
        assert_eq!(opts.maxfilesize, 100_000);
        assert!(opts.stats_per_splitfile);

        let opts = CaptureOptions::resolve(&cli(&["--Maxfilesize", "-100000"])).unwrap();
        assert_eq!(opts.maxfilesize, 100_000);
        assert!(!opts.stats_per_splitfile);
    }

    #[test]
    fn test_end_and_duration_conflict() {
        assert_eq!(
            CaptureOptions::resolve(&cli(&[
                "--End",
                "2030-01-01T00:00:00",
                "--duration",
                "10"
            ])),
            Err(ConfigError::EndAndDuration)
        );
    }

    #[test]
    fn test_stdin_constraints() {
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--ports", "0"])),
            Err(ConfigError::StdinNeedsLen)
        );
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--ports", "0", "--len", "512", "--duration", "5"])),
            Err(ConfigError::StdinTimes)
        );
        let opts =
            CaptureOptions::resolve(&cli(&["--ports", "0", "--len", "512"])).unwrap();
        assert!(opts.stdin_mode());
    }

    #[test]
    fn test_compcommand_needs_placeholder() {
        assert_eq!(
            CaptureOptions::resolve(&cli(&["--compcommand", "gzip -c > out.gz"])),
            Err(ConfigError::CompCommand)
        );
        let opts =
            CaptureOptions::resolve(&cli(&["--compcommand", "zstd -q -f -o %s"])).unwrap();
        assert_eq!(opts.compcommand, "zstd -q -f -o %s");
    }
}
