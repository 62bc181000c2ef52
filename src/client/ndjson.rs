//! Line-delimited JSON streaming.
//!
//! The transport hands us arbitrary byte chunks, so a JSON line can arrive split
//! across reads. [`LineBuffer`] keeps the incomplete tail until the next chunk
//! completes it. [`NdjsonStream`] runs the read loop on a background task and
//! hands decoded items to the consumer as a [`Stream`]; dropping the stream
//! aborts the task, which drops the response and closes the connection.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ServiceError, ServiceResult};

/// Items buffered between the reader task and the consumer.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, in arrival order.
    /// Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> ServiceResult<Vec<String>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = decode_utf8(&raw[..raw.len() - 1])?;
            if !line.trim().is_empty() {
                lines.push(line.trim().to_string());
            }
        }
        Ok(lines)
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> ServiceResult<Option<String>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let raw = std::mem::take(&mut self.pending);
        let line = decode_utf8(&raw)?;
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

fn decode_utf8(bytes: &[u8]) -> ServiceResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ServiceError::InvalidResponse(format!("stream line is not UTF-8: {e}")))
}

/// A one-shot sequence of decoded stream items.
///
/// Items come out in server-emission order. Not restartable: once drained
/// (or dropped) a new request is needed.
pub struct NdjsonStream<T> {
    items: ReceiverStream<ServiceResult<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> NdjsonStream<T> {
    /// Start reading `response` on a background task.
    ///
    /// `decode` turns one line into an item; the stream ends after the first
    /// item for which `is_terminal` returns true, on the first error, or when
    /// the server closes the connection.
    pub(crate) fn spawn(
        response: reqwest::Response,
        decode: fn(&str) -> ServiceResult<T>,
        is_terminal: fn(&T) -> bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(pump(response, decode, is_terminal, tx));
        Self {
            items: ReceiverStream::new(rx),
            task,
        }
    }
}

impl<T> Stream for NdjsonStream<T> {
    type Item = ServiceResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.items).poll_next(cx)
    }
}

impl<T> Drop for NdjsonStream<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump<T>(
    mut response: reqwest::Response,
    decode: fn(&str) -> ServiceResult<T>,
    is_terminal: fn(&T) -> bool,
    tx: mpsc::Sender<ServiceResult<T>>,
) {
    let mut buffer = LineBuffer::default();

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(Err(ServiceError::ConnectionFailed(format!(
                        "stream interrupted: {e}"
                    ))))
                    .await;
                return;
            }
        };

        let lines = match buffer.push(&chunk) {
            Ok(lines) => lines,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for line in lines {
            if !forward(&line, decode, is_terminal, &tx).await {
                return;
            }
        }
    }

    match buffer.finish() {
        Ok(Some(line)) => {
            forward(&line, decode, is_terminal, &tx).await;
        }
        Ok(None) => {}
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// Decode and send one line. Returns `false` when reading should stop.
async fn forward<T>(
    line: &str,
    decode: fn(&str) -> ServiceResult<T>,
    is_terminal: fn(&T) -> bool,
    tx: &mpsc::Sender<ServiceResult<T>>,
) -> bool {
    match decode(line) {
        Ok(item) => {
            let done = is_terminal(&item);
            // A closed receiver means the consumer walked away.
            tx.send(Ok(item)).await.is_ok() && !done
        }
        Err(e) => {
            tracing::warn!(error = %e, "undecodable stream line");
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}
