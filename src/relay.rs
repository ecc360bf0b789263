//! Chunk-by-chunk copy of a live upstream body to the caller.
//!
//! The destination must implement [`FlushSink`]: a sink that cannot flush
//! would sit on tokens until its buffer fills, so it cannot be passed to
//! [`relay`] at all. Dialects that stream their own event format go through
//! [`translate_events`] first, which yields one chunk per translated event.

use std::io;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::codec::StreamTranslator;

/// Largest piece written between two flushes.
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// A byte sink with an explicit flush.
#[async_trait]
pub trait FlushSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Push everything written so far to the peer.
    async fn flush(&mut self) -> io::Result<()>;
}

/// Copy `source` into `dest`, flushing after every piece.
///
/// Returns the number of bytes read once `source` ends cleanly. The first
/// read or write error stops the copy and is returned as-is.
pub async fn relay<D, S, E>(dest: &mut D, source: S) -> io::Result<u64>
where
    D: FlushSink + ?Sized,
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    futures::pin_mut!(source);
    let mut total: u64 = 0;

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        if chunk.is_empty() {
            continue;
        }
        total += chunk.len() as u64;

        for piece in chunk.chunks(RELAY_CHUNK_SIZE) {
            dest.write(piece).await?;
            dest.flush().await?;
        }
    }

    Ok(total)
}

/// Sink feeding an axum response body through a bounded channel.
///
/// Each flush hands one frame to the body. Once the caller disconnects the
/// receiving half is dropped and the next write or flush fails with
/// `BrokenPipe`.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    pending: BytesMut,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<io::Result<Bytes>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx,
            pending: BytesMut::with_capacity(RELAY_CHUNK_SIZE),
        };
        (sink, ReceiverStream::new(rx))
    }

    /// Handle that resolves once the caller has gone away.
    pub fn disconnect_watch(&self) -> DisconnectWatch {
        DisconnectWatch(self.tx.clone())
    }

    /// Fail the response body so the caller sees a truncated transfer
    /// instead of a clean end of stream.
    pub async fn abort(&self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

#[async_trait]
impl FlushSink for ChannelSink {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(client_gone());
        }
        self.pending.extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = self.pending.split().freeze();
        self.tx.send(Ok(frame)).await.map_err(|_| client_gone())
    }
}

pub struct DisconnectWatch(mpsc::Sender<io::Result<Bytes>>);

impl DisconnectWatch {
    pub async fn wait(&self) {
        self.0.closed().await;
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

/// Re-frame an upstream SSE body through `translator`.
///
/// Each `data:` line is handed to the translator and every frame it returns
/// becomes its own chunk, so [`relay`] flushes per event. A read error ends
/// the stream with that error; a clean end lets the translator close it.
pub fn translate_events<S, E>(
    source: S,
    mut translator: Box<dyn StreamTranslator>,
) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    async_stream::stream! {
        futures::pin_mut!(source);
        let mut buffer = BytesMut::new();

        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(io::Error::other(e));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(newline + 1);
                let line = String::from_utf8_lossy(&line);
                if let Some(data) = line.trim().strip_prefix("data:") {
                    for frame in translator.on_event(data.trim()) {
                        yield Ok(frame);
                    }
                }
            }
        }

        for frame in translator.finish() {
            yield Ok(frame);
        }
    }
}

/// Wrap a streaming body with event-stream headers under the upstream's
/// status.
pub fn event_stream_response(status: StatusCode, body: Body) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
