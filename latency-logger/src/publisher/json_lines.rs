//! A [`Publisher`] writing one JSON object per line to any [`AsyncWrite`].
//!
//! Records are encoded by the publishing worker and handed to a single writer task through a
//! bounded buffer, so a slow sink applies backpressure to the workers. If the sink fails the
//! writer task stops and every later publish fails with [`PublishError::Closed`].
//!
//! The writer flushes whenever it has drained its buffer, so a record reaches the sink as soon
//! as no other record is waiting behind it.
use std::{io, path::Path};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::{PublishError, Publisher};
use crate::record::LatencyRecord;

enum Command {
    Line(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line(line) => write!(f, "Line({} bytes)", line.len()),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonLinesPublisher {
    sender: mpsc::Sender<Command>,
}

impl JsonLinesPublisher {
    pub const DEFAULT_BUFFER: usize = 1024;

    /// Spawns the writer task for `writer`, buffering at most `buffer` records.
    ///
    /// The returned handle completes once every clone of the publisher has been dropped and the
    /// remaining records have been written and flushed.
    pub fn spawn<W>(writer: W, buffer: usize) -> (Self, JoinHandle<io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(write_lines(BufWriter::new(writer), receiver));
        (Self { sender }, handle)
    }

    /// Publishes to standard output.
    pub fn stdout(buffer: usize) -> (Self, JoinHandle<io::Result<()>>) {
        Self::spawn(tokio::io::stdout(), buffer)
    }

    /// Publishes to the file at `path`, appending if it exists.
    pub async fn append_to(
        path: impl AsRef<Path>,
        buffer: usize,
    ) -> io::Result<(Self, JoinHandle<io::Result<()>>)> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::spawn(file, buffer))
    }
}

async fn write_lines<W>(
    mut writer: BufWriter<W>,
    mut receiver: mpsc::Receiver<Command>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut waiting = Vec::new();
    while let Some(command) = receiver.recv().await {
        // Everything already queued goes out under a single flush.
        let mut next = Some(command);
        while let Some(command) = next {
            match command {
                Command::Line(line) => {
                    if let Err(err) = writer.write_all(&line).await {
                        tracing::error!(?err, "Failed to write latency record: {err}");
                        return Err(err);
                    }
                }
                Command::Flush(done) => waiting.push(done),
            }
            next = receiver.try_recv().ok();
        }

        let flushed = writer.flush().await;
        for done in waiting.drain(..) {
            let _ = done.send(match &flushed {
                Ok(()) => Ok(()),
                Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
            });
        }
        if let Err(err) = flushed {
            tracing::error!(?err, "Failed to flush latency records: {err}");
            return Err(err);
        }
    }
    writer.flush().await
}

#[async_trait]
impl Publisher for JsonLinesPublisher {
    async fn publish(&self, record: &LatencyRecord) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.sender
            .send(Command::Line(line))
            .await
            .map_err(|_| PublishError::Closed)
    }

    async fn flush(&self) -> Result<(), PublishError> {
        let (done, flushed) = oneshot::channel();
        self.sender
            .send(Command::Flush(done))
            .await
            .map_err(|_| PublishError::Closed)?;
        flushed
            .await
            .map_err(|_| PublishError::Closed)?
            .map_err(|err| PublishError::Fatal(err.to_string()))
    }
}
