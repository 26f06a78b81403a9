//! Response streaming with periodic flush.
//!
//! The copy task only buffers what it reads from the upstream; bytes reach
//! the client when the flush timer fires, the buffer passes a threshold, or
//! the upstream body ends. Long-lived watch responses therefore arrive
//! incrementally at the configured cadence. An upstream read error, or a
//! body still open at its deadline, is passed on as a body error so the
//! client connection is aborted instead of ending as if the response were
//! complete.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

pub type ProxyBody = UnsyncBoxBody<Bytes, BodyError>;

/// Buffered bytes are flushed early once they reach this size.
pub const FLUSH_THRESHOLD: usize = 32 * 1024;

const CHANNEL_CAPACITY: usize = 16;

/// Called once when the upstream body ends: `Ok` after a complete copy,
/// `Err` with the read error otherwise. Dropped uncalled when the client
/// goes away first.
pub type Completion = Box<dyn FnOnce(Result<(), String>) + Send>;

#[derive(Debug, Error)]
#[error("upstream response body failed: {0}")]
pub struct UpstreamBodyError(pub String);

/// A fully buffered response body.
pub fn full_body(body: Full<Bytes>) -> ProxyBody {
    body.map_err(|never| match never {}).boxed_unsync()
}

/// Counts response copies still running, so shutdown can wait for the
/// audit records they close.
#[derive(Debug, Clone)]
pub struct StreamTracker {
    active: Arc<watch::Sender<()>>,
}

/// Held by one copy task for its whole lifetime.
pub struct StreamGuard {
    _active: watch::Receiver<()>,
}

impl Default for StreamTracker {
    fn default() -> Self {
        let (active, _) = watch::channel(());
        Self {
            active: Arc::new(active),
        }
    }
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> StreamGuard {
        StreamGuard {
            _active: self.active.subscribe(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.receiver_count()
    }

    /// Resolves once every tracked copy has ended.
    pub async fn wait_idle(&self) {
        self.active.closed().await
    }
}

/// Flush interval for one response: zero (every chunk) for server-sent
/// events, the configured interval otherwise.
pub fn flush_interval_for(configured: Duration, content_type: Option<&str>) -> Duration {
    match content_type {
        Some(ct) if ct.starts_with("text/event-stream") => Duration::ZERO,
        _ => configured,
    }
}

/// Spawns the copy task and returns the client-facing body. With a
/// `deadline` the copy fails once it passes; long-running responses pass
/// `None`.
pub fn flushing_body<S, E>(
    upstream: S,
    flush_interval: Duration,
    deadline: Option<Instant>,
    completion: Option<Completion>,
    guard: StreamGuard,
) -> ProxyBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        copy_with_flush(upstream, tx, flush_interval, deadline, completion).await;
        drop(guard);
    });
    ChannelBody { rx }.boxed_unsync()
}

type Chunk = Result<Bytes, BodyError>;

enum CopyEnd {
    Complete,
    UpstreamFailed(String),
    ClientGone,
}

async fn copy_with_flush<S, E>(
    upstream: S,
    tx: mpsc::Sender<Chunk>,
    flush_interval: Duration,
    deadline: Option<Instant>,
    completion: Option<Completion>,
) where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    tokio::pin!(upstream);

    let expiry = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);

    let immediate = flush_interval.is_zero();
    let mut ticker = interval(if immediate {
        Duration::from_secs(3600)
    } else {
        flush_interval
    });
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes at once.
    ticker.tick().await;

    let mut buffer = BytesMut::new();

    let end = loop {
        tokio::select! {
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    if (immediate || buffer.len() >= FLUSH_THRESHOLD) && !flush(&tx, &mut buffer).await {
                        break CopyEnd::ClientGone;
                    }
                }
                Some(Err(err)) => {
                    let reason = err.to_string();
                    if flush(&tx, &mut buffer).await {
                        let error: BodyError = Box::new(UpstreamBodyError(reason.clone()));
                        let _ = tx.send(Err(error)).await;
                    }
                    break CopyEnd::UpstreamFailed(reason);
                }
                None => {
                    break if flush(&tx, &mut buffer).await {
                        CopyEnd::Complete
                    } else {
                        CopyEnd::ClientGone
                    };
                }
            },
            _ = ticker.tick(), if !immediate => {
                if !flush(&tx, &mut buffer).await {
                    break CopyEnd::ClientGone;
                }
            }
            _ = &mut expiry => {
                let reason = "deadline exceeded".to_string();
                if flush(&tx, &mut buffer).await {
                    let error: BodyError = Box::new(UpstreamBodyError(reason.clone()));
                    let _ = tx.send(Err(error)).await;
                }
                break CopyEnd::UpstreamFailed(reason);
            }
            _ = tx.closed() => break CopyEnd::ClientGone,
        }
    };

    match end {
        CopyEnd::Complete => {
            if let Some(done) = completion {
                done(Ok(()));
            }
        }
        CopyEnd::UpstreamFailed(reason) => {
            warn!(error = %reason, "Upstream body ended with an error");
            if let Some(done) = completion {
                done(Err(reason));
            }
        }
        CopyEnd::ClientGone => {
            debug!("Client went away during response streaming");
        }
    }
}

/// Hands buffered bytes to the client. `false` once the client is gone.
async fn flush(tx: &mpsc::Sender<Chunk>, buffer: &mut BytesMut) -> bool {
    if buffer.is_empty() {
        return !tx.is_closed();
    }
    tx.send(Ok(buffer.split().freeze())).await.is_ok()
}

struct ChannelBody {
    rx: mpsc::Receiver<Chunk>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}
