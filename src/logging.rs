//! Log plumbing: tracing setup for the tool's own output, and the
//! line-buffered prefix writer that tags child-process output.

use std::io::Write;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Steady-state output is the proxy's and the backend's; the watcher and
/// build internals only surface with `--debug`, at any severity.
pub fn init(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("off,proxy=info,backend=info")
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Wraps a sink and prefixes every complete line written through it.
///
/// An unterminated tail is buffered until its newline arrives, so
/// interleaved writers on different streams never split each other's
/// lines. Single-writer per child stream.
pub struct PrefixWriter<W: Write> {
    prefix: String,
    out: W,
    tail: Vec<u8>,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(prefix: impl Into<String>, out: W) -> Self {
        Self {
            prefix: prefix.into(),
            out,
            tail: Vec::new(),
        }
    }

    /// Appends `chunk`, emitting every complete line with the prefix.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.tail.extend_from_slice(chunk);
        while let Some(pos) = self.tail.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.tail.drain(..=pos).collect();
            self.out.write_all(self.prefix.as_bytes())?;
            self.out.write_all(&line)?;
        }
        self.out.flush()
    }

    /// Emits a trailing partial line, if any, with a newline appended.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if !self.tail.is_empty() {
            self.out.write_all(self.prefix.as_bytes())?;
            self.out.write_all(&self.tail)?;
            self.out.write_all(b"\n")?;
            self.tail.clear();
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Copies a child stream to stdout, tagging each line with `prefix`.
///
/// Runs until the stream closes (child exit) and then flushes whatever
/// partial line is left.
pub async fn pump_child_stream<R>(mut reader: R, prefix: String)
where
    R: AsyncRead + Unpin,
{
    let mut writer = PrefixWriter::new(prefix, std::io::stdout());
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_chunk(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.finish();
}
