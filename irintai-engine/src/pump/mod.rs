//! Background reader for engine output.
//!
//! The pump merges stdout and stderr of a child process into one stream of
//! cleaned lines, splitting on both `\n` and `\r` so that progress bars that
//! redraw in place still yield one line per update. Invalid UTF-8 is decoded
//! with replacement characters.

mod clean;

pub use clean::{clean_line, is_completion_marker, strip_control_sequences};

use std::io;

use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};

/// A cleaned line of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpLine {
    /// Ordinary output
    Content(String),
    /// The engine is ready for the next input
    Marker,
}

impl PumpLine {
    /// Classify a raw output segment, dropping lines that are blank once cleaned.
    pub fn classify(raw: &str) -> Option<PumpLine> {
        let line = clean_line(raw);
        if line.is_empty() {
            None
        } else if is_completion_marker(&line) {
            Some(PumpLine::Marker)
        } else {
            Some(PumpLine::Content(line))
        }
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// Both pipes reached end of file
    Closed,
    /// The generation was superseded or stopped
    Cancelled,
    /// Reading failed
    Failed(io::Error),
}

/// Merge two pipes into one stream of decoded, unclean segments.
pub fn merged_lines<O, E>(
    stdout: O,
    stderr: E,
) -> impl Stream<Item = io::Result<String>> + Unpin + Send + 'static
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let out = FramedRead::new(stdout, segment_codec()).map(decode_segment);
    let err = FramedRead::new(stderr, segment_codec()).map(decode_segment);
    out.merge(err)
}

fn segment_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\n\r".to_vec(), b"\n".to_vec())
}

fn decode_segment<B: AsRef<[u8]>>(
    segment: std::result::Result<B, AnyDelimiterCodecError>,
) -> io::Result<String> {
    match segment {
        Ok(bytes) => Ok(String::from_utf8_lossy(bytes.as_ref()).into_owned()),
        Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        Err(other) => Err(io::Error::other(other)),
    }
}

/// Drains engine output on a dedicated task.
pub struct OutputPump;

impl OutputPump {
    /// Take the child's output pipes and start pumping them.
    ///
    /// `on_line` receives every non-blank line in production order;
    /// `on_exit` runs once when the pipes close, reading fails, or `cancel`
    /// fires. The pump never outlives its generation's token.
    pub fn attach<F, G>(
        child: &mut Child,
        generation: u64,
        cancel: CancellationToken,
        on_line: F,
        on_exit: G,
    ) -> Result<JoinHandle<()>>
    where
        F: FnMut(PumpLine) + Send + 'static,
        G: FnOnce(PumpExit) + Send + 'static,
    {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io(io::Error::other("engine stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io(io::Error::other("engine stderr was not captured")))?;

        Ok(Self::attach_pipes(
            stdout, stderr, generation, cancel, on_line, on_exit,
        ))
    }

    /// Pump arbitrary readers; used directly by tests.
    pub fn attach_pipes<O, E, F, G>(
        stdout: O,
        stderr: E,
        generation: u64,
        cancel: CancellationToken,
        on_line: F,
        on_exit: G,
    ) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
        F: FnMut(PumpLine) + Send + 'static,
        G: FnOnce(PumpExit) + Send + 'static,
    {
        let lines = merged_lines(stdout, stderr);
        tokio::spawn(Self::run(lines, generation, cancel, on_line, on_exit))
    }

    async fn run<S, F, G>(
        mut lines: S,
        generation: u64,
        cancel: CancellationToken,
        mut on_line: F,
        on_exit: G,
    ) where
        S: Stream<Item = io::Result<String>> + Unpin,
        F: FnMut(PumpLine),
        G: FnOnce(PumpExit),
    {
        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PumpExit::Cancelled,
                next = lines.next() => match next {
                    Some(Ok(raw)) => {
                        if let Some(line) = PumpLine::classify(&raw) {
                            if let PumpLine::Content(ref text) = line {
                                trace!(target: "irintai::engine", generation, "{}", text);
                            }
                            on_line(line);
                        }
                    }
                    Some(Err(e)) => break PumpExit::Failed(e),
                    None => break PumpExit::Closed,
                },
            }
        };

        debug!(generation, exit = ?exit, "Output pump finished");
        on_exit(exit);
    }
}
