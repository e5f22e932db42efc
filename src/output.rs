//! Output sinks and the capture filename scheme.
//!
//! A sink is either a plain file or the stdin of a compression subprocess.
//! Closing a pipe sink waits for the child and reports the on-disk size so
//! the compression ratio can be logged.

use std::fs::File;
use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as fractional unix seconds.
pub fn realtime() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// UTC timestamp with millisecond precision, `yyyy-mm-ddThh:mm:ss.mmm`.
pub fn timestamp_to_str(timestamp: f64) -> String {
    let secs = timestamp.floor();
    let millis = ((timestamp - secs) * 1e3) as u32;
    let datetime = chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .unwrap_or_default();
    format!("{}.{:03}", datetime.format("%Y-%m-%dT%H:%M:%S"), millis)
}

/// Builds capture filenames: `<base>_<portlist>.<hostname>.<timestamp>`,
/// plus `_NNNN` for numbered (split) files and `.zst` when compressing.
/// The base `/dev/null` is used verbatim.
#[derive(Debug, Clone)]
pub struct FileNamer {
    pub base: String,
    pub portlist: String,
    pub hostname: String,
    pub compress: bool,
}

impl FileNamer {
    pub fn build(&self, timestamp: f64, filenumber: Option<u32>) -> String {
        if self.base == "/dev/null" {
            return self.base.clone();
        }
        let mut name = format!(
            "{}_{}.{}.{}",
            self.base,
            self.portlist,
            self.hostname,
            timestamp_to_str(timestamp)
        );
        if let Some(number) = filenumber {
            name.push_str(&format!("_{:04}", number));
        }
        if self.compress {
            name.push_str(".zst");
        }
        name
    }
}

pub enum OutputSink {
    File {
        file: File,
        path: String,
    },
    Pipe {
        child: Child,
        stdin: Option<ChildStdin>,
        path: String,
    },
}

impl OutputSink {
    pub fn open_file(path: &str) -> io::Result<Self> {
        Ok(OutputSink::File {
            file: File::create(path)?,
            path: path.to_string(),
        })
    }

    /// Spawn the compression command (with `%s` replaced by the target
    /// filename) and keep its stdin as the sink.
    pub fn open_pipe(compcommand: &str, path: &str) -> io::Result<Self> {
        let command = compcommand.replace("%s", path);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(OutputSink::Pipe {
            child,
            stdin,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        match self {
            OutputSink::File { path, .. } => path,
            OutputSink::Pipe { path, .. } => path,
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            OutputSink::File { file, .. } => file.write_all(buf),
            OutputSink::Pipe { stdin, .. } => match stdin {
                Some(stdin) => stdin.write_all(buf),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "compression pipe already closed",
                )),
            },
        }
    }

    /// Close the sink. For a pipe this flushes, hands EOF to the child,
    /// waits for it, and returns the compressed on-disk size (0 when the
    /// file cannot be inspected). A child that exits nonzero is an error;
    /// the data written so far stays on disk either way.
    pub fn close(self) -> io::Result<Option<u64>> {
        match self {
            OutputSink::File { file, .. } => {
                drop(file);
                Ok(None)
            }
            OutputSink::Pipe {
                mut child,
                stdin,
                path,
            } => {
                if let Some(mut stdin) = stdin {
                    stdin.flush()?;
                    drop(stdin);
                }
                let status = child.wait()?;
                if !status.success() {
                    return Err(io::Error::other(format!(
                        "compression pipeline exited with {}",
                        status
                    )));
                }
                let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                Ok(Some(len))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_timestamp_format() {
        assert_eq!(timestamp_to_str(0.0), "1970-01-01T00:00:00.000");
        assert_eq!(timestamp_to_str(1_543_384_831.25), "2018-11-28T06:00:31.250");
    }

    #[test]
    fn test_filename_template() {
        let namer = FileNamer {
            base: "/data/cap".into(),
            portlist: "16011,16012".into(),
            hostname: "rec-node4".into(),
            compress: false,
        };
        assert_eq!(
            namer.build(1_543_384_831.0, None),
            "/data/cap_16011,16012.rec-node4.2018-11-28T06:00:31.000"
        );
        assert_eq!(
            namer.build(1_543_384_831.0, Some(3)),
            "/data/cap_16011,16012.rec-node4.2018-11-28T06:00:31.000_0003"
        );
    }

    #[test]
    fn test_filename_compress_suffix_and_dev_null() {
        let namer = FileNamer {
            base: "x".into(),
            portlist: "4346".into(),
            hostname: "h".into(),
            compress: true,
        };
        assert!(namer.build(0.0, Some(0)).ends_with("_0000.zst"));

        let namer = FileNamer {
            base: "/dev/null".into(),
            portlist: "4346".into(),
            hostname: "h".into(),
            compress: true,
        };
        assert_eq!(namer.build(0.0, Some(7)), "/dev/null");
    }

    #[test]
    fn test_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let path = path.to_str().unwrap();
        let mut sink = OutputSink::open_file(path).unwrap();
        sink.write_all(b"hello").unwrap();
        sink.write_all(b" world").unwrap();
        assert_eq!(sink.close().unwrap(), None);

        let mut contents = Vec::new();
        File::open(path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn test_pipe_sink_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piped.bin");
        let path = path.to_str().unwrap();
        // `cat > %s` stands in for a real compressor.
        let mut sink = OutputSink::open_pipe("cat > %s", path).unwrap();
        sink.write_all(b"datagram payload").unwrap();
        let reported = sink.close().unwrap();
        assert_eq!(reported, Some(16));

        let mut contents = Vec::new();
        File::open(path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"datagram payload");
    }

    #[test]
    fn test_pipe_sink_failure_is_error() {
        let sink = OutputSink::open_pipe("exit 3 # %s", "/tmp/unused").unwrap();
        assert!(sink.close().is_err());
    }
}
