//! Per-viewer MJPEG pump
//!
//! A pump polls the [`FrameStore`] for one stream id at a fixed rate, renders
//! whatever frame is current and pushes one `multipart/x-mixed-replace` part
//! per tick into a bounded channel read by the HTTP body.
//!
//! ```text
//!   interval.tick() ──► store.get(id) ──► render (blocking pool) ──► tx.send(chunk)
//!        ▲                  │ None              │ Err                    │
//!        └──────────────────┴───────────────────┘◄───────────────────────┘
//! ```
//!
//! The loop has no terminal state of its own. It ends when the receiving side
//! is dropped (viewer disconnected) or the task is aborted.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, FrameCodec};
use crate::stats::RelayStats;
use crate::store::FrameStore;

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Content type of an MJPEG response
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace;boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PumpError {
    #[error("invalid frequency {0}: must be a positive, finite number of Hz")]
    InvalidFrequency(f64),
}

/// Tick period for a poll frequency in Hz
pub fn period_for(freq: f64) -> Result<Duration, PumpError> {
    if !(freq.is_finite() && freq > 0.0) {
        return Err(PumpError::InvalidFrequency(freq));
    }
    Duration::try_from_secs_f64(1.0 / freq).map_err(|_| PumpError::InvalidFrequency(freq))
}

/// Wrap a JPEG in one multipart part
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    buf.put_slice(PART_HEADER);
    buf.put_slice(jpeg);
    buf.put_slice(PART_TRAILER);
    buf.freeze()
}

/// Result of a single poll
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing stored for the stream yet
    Absent,
    /// A frame newer than the last emitted one was rendered
    Fresh(Bytes),
    /// Stored frame unchanged; previously rendered chunk is reused
    Repeat(Bytes),
    /// Stored frame cannot be decoded or re-encoded
    CodecFailed(Arc<CodecError>),
    /// Render task panicked or was cancelled
    RenderAborted,
}

pub struct StreamPump {
    store: Arc<FrameStore>,
    codec: FrameCodec,
    stats: Arc<RelayStats>,
    stream_id: String,
    period: Duration,
    last: Option<(u64, Bytes)>,
    failed: Option<(u64, Arc<CodecError>)>,
}

impl StreamPump {
    /// Create a pump polling `stream_id` at `freq` Hz
    ///
    /// Fails before anything is spawned if `freq` is not a positive number.
    pub fn new(
        store: Arc<FrameStore>,
        codec: FrameCodec,
        stats: Arc<RelayStats>,
        stream_id: impl Into<String>,
        freq: f64,
    ) -> Result<Self, PumpError> {
        let period = period_for(freq)?;

        Ok(Self {
            store,
            codec,
            stats,
            stream_id: stream_id.into(),
            period,
            last: None,
            failed: None,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Poll the store once and produce the chunk for this tick, if any
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(frame) = self.store.get(&self.stream_id) else {
            return TickOutcome::Absent;
        };

        if let Some((seq, chunk)) = &self.last {
            if *seq == frame.seq {
                return TickOutcome::Repeat(chunk.clone());
            }
        }

        if let Some((seq, err)) = &self.failed {
            if *seq == frame.seq {
                return TickOutcome::CodecFailed(Arc::clone(err));
            }
        }

        let codec = self.codec;
        let payload = frame.payload;
        match tokio::task::spawn_blocking(move || codec.render(&payload)).await {
            Ok(Ok(jpeg)) => {
                let chunk = multipart_chunk(&jpeg);
                debug!(
                    stream = %self.stream_id,
                    seq = frame.seq,
                    jpeg_bytes = jpeg.len(),
                    "Frame rendered"
                );
                self.last = Some((frame.seq, chunk.clone()));
                self.failed = None;
                TickOutcome::Fresh(chunk)
            }
            Ok(Err(e)) => {
                warn!(stream = %self.stream_id, seq = frame.seq, error = %e, "Skipping undecodable frame");
                let err = Arc::new(e);
                self.failed = Some((frame.seq, Arc::clone(&err)));
                TickOutcome::CodecFailed(err)
            }
            Err(e) => {
                error!(stream = %self.stream_id, seq = frame.seq, error = %e, "Render task failed");
                TickOutcome::RenderAborted
            }
        }
    }

    /// Count a tick outcome and return the chunk to send, if any
    fn record(&self, outcome: TickOutcome) -> Option<Bytes> {
        match outcome {
            TickOutcome::Fresh(chunk) | TickOutcome::Repeat(chunk) => Some(chunk),
            TickOutcome::Absent => {
                self.stats.record_absent();
                None
            }
            TickOutcome::CodecFailed(_) => {
                self.stats.record_codec_failure();
                None
            }
            TickOutcome::RenderAborted => {
                self.stats.record_render_abort();
                None
            }
        }
    }

    /// Run until the receiver of `tx` is dropped
    pub async fn run(mut self, tx: mpsc::Sender<Bytes>) {
        let _viewer = self.stats.viewer_guard();

        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stream = %self.stream_id,
            period_ms = self.period.as_secs_f64() * 1000.0,
            "Viewer connected"
        );

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }

            let outcome = self.tick().await;
            let Some(chunk) = self.record(outcome) else {
                continue;
            };

            let len = chunk.len();
            if tx.send(chunk).await.is_err() {
                break;
            }
            self.stats.record_chunk(len);
        }

        info!(stream = %self.stream_id, "Viewer disconnected");
    }

    /// Spawn the pump and return the stream of chunks it produces
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self, capacity: usize) -> MjpegStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(tx));
        MjpegStream { rx, handle }
    }
}

/// Chunks of an MJPEG body; dropping it stops the pump
pub struct MjpegStream {
    rx: mpsc::Receiver<Bytes>,
    handle: JoinHandle<()>,
}

impl Stream for MjpegStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
