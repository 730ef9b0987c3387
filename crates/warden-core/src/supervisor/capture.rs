//! Background capture of the server's output.
//!
//! On unix the server writes stdout and stderr into one pipe, read by a
//! single task, so a stack trace stays next to the log lines around it.
//! Elsewhere each stream gets its own reader. Readers feed a channel drained
//! by one writer that records every non-blank line with level `output`. The
//! writer is a blocking task since each append touches disk.

use crate::event::OutputEvent;
use crate::sink::OutputSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Buffered lines between the readers and the writer.
const LINE_BUFFER: usize = 256;

type OutputStream = Box<dyn AsyncRead + Unpin + Send>;

/// Read side of a spawned server's output.
#[derive(Debug)]
pub(crate) enum ServerOutput {
    /// stdout and stderr sharing one pipe.
    #[cfg(unix)]
    Combined(tokio::net::unix::pipe::Receiver),
    #[cfg(not(unix))]
    Split(tokio::process::ChildStdout, tokio::process::ChildStderr),
}

impl ServerOutput {
    fn into_streams(self) -> Vec<OutputStream> {
        match self {
            #[cfg(unix)]
            Self::Combined(pipe) => vec![Box::new(pipe)],
            #[cfg(not(unix))]
            Self::Split(stdout, stderr) => vec![Box::new(stdout), Box::new(stderr)],
        }
    }
}

/// Capture tasks for one process lifetime.
#[derive(Debug)]
pub(crate) struct Capture {
    readers: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Capture {
    /// Start capturing the server's output into `sink`.
    pub fn spawn(output: ServerOutput, sink: Arc<OutputSink>) -> Self {
        Self::from_streams(output.into_streams(), sink)
    }

    fn from_streams(streams: Vec<OutputStream>, sink: Arc<OutputSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);

        let readers = streams
            .into_iter()
            .map(|stream| tokio::spawn(forward_lines(stream, tx.clone())))
            .collect();
        drop(tx);

        let writer = tokio::task::spawn_blocking(move || {
            while let Some(line) = rx.blocking_recv() {
                sink.append(OutputEvent::output(line));
            }
            debug!("Output capture finished");
        });

        Self { readers, writer }
    }

    /// Wait for the remaining output to be recorded.
    ///
    /// The pipes may outlive the server if it left children behind holding
    /// them, so after `timeout` the readers are cancelled.
    pub async fn finish(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.writer).await.is_ok() {
            return;
        }

        debug!("Output still open after {:?}, detaching readers", timeout);
        for reader in &self.readers {
            reader.abort();
        }
        let _ = self.writer.await;
    }
}

async fn forward_lines(stream: OutputStream, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(line) = clean_line(&buf) else {
                    continue;
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

/// Strip the line terminator; `None` for a blank line.
fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}
