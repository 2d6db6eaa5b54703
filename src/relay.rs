//! Frame relay service
//!
//! [`FrameRelay`] is the one object the rest of the process talks to. It is
//! created once at startup, owns the shared [`FrameStore`] and is cloned
//! (cheaply, everything is behind `Arc`) into every handler.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CodecError, FrameCodec, FrameInput};
use crate::config::RelayConfig;
use crate::pump::{MjpegStream, PumpError, StreamPump};
use crate::stats::RelayStats;
use crate::store::{FrameStore, StoreError, StoreLimits};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pump(#[from] PumpError),
}

/// Per-request options for [`FrameRelay::get_stream`]
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Poll frequency in Hz
    pub freq: f64,
    pub status: StatusCode,
    /// Extra response headers
    pub headers: HeaderMap,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            freq: 30.0,
            status: StatusCode::PARTIAL_CONTENT,
            headers: HeaderMap::new(),
        }
    }
}

impl StreamOptions {
    pub fn with_freq(mut self, freq: f64) -> Self {
        self.freq = freq;
        self
    }
}

/// A ready-to-serve MJPEG response
pub struct MjpegResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: MjpegStream,
}

#[derive(Clone)]
pub struct FrameRelay {
    store: Arc<FrameStore>,
    codec: FrameCodec,
    stats: Arc<RelayStats>,
    defaults: StreamOptions,
    channel_capacity: usize,
}

impl FrameRelay {
    pub fn new(store: Arc<FrameStore>, codec: FrameCodec) -> Self {
        Self {
            store,
            codec,
            stats: Arc::new(RelayStats::new()),
            defaults: StreamOptions::default(),
            channel_capacity: 2,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let store = Arc::new(FrameStore::with_limits(StoreLimits {
            max_streams: config.max_streams,
            max_frame_bytes: config.max_frame_bytes,
        }));

        let mut relay = Self::new(store, FrameCodec::from_config(config));
        relay.defaults.freq = config.default_freq;
        relay.defaults.status =
            StatusCode::from_u16(config.stream_status).unwrap_or(StatusCode::PARTIAL_CONTENT);
        relay.channel_capacity = config.channel_capacity;
        relay
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Stream options used when a viewer does not override them
    pub fn default_options(&self) -> StreamOptions {
        self.defaults.clone()
    }

    /// Store `frame` as the latest frame of `stream_id`
    ///
    /// Returns the stream's new sequence number. Base64 text is not
    /// validated here; a malformed frame is stored and skipped by viewers.
    pub async fn send_frame(
        &self,
        stream_id: &str,
        frame: FrameInput<'_>,
    ) -> Result<u64, RelayError> {
        let payload = match self.codec.canonicalize(frame).await {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_rejected();
                warn!(stream = %stream_id, error = %e, "Rejected frame input");
                return Err(e.into());
            }
        };

        let size = payload.len();
        match self.store.upsert(stream_id, payload.into_bytes()) {
            Ok(seq) => {
                self.stats.record_stored();
                debug!(stream = %stream_id, seq, bytes = size, "Frame accepted");
                Ok(seq)
            }
            Err(e) => {
                self.stats.record_rejected();
                warn!(stream = %stream_id, error = %e, "Failed to store frame");
                Err(e.into())
            }
        }
    }

    /// Start an MJPEG stream of `stream_id`
    ///
    /// An invalid frequency is reported here, before a pump is spawned.
    /// Must be called from within a Tokio runtime.
    pub fn get_stream(
        &self,
        stream_id: &str,
        options: StreamOptions,
    ) -> Result<MjpegResponse, RelayError> {
        let pump = StreamPump::new(
            Arc::clone(&self.store),
            self.codec,
            Arc::clone(&self.stats),
            stream_id,
            options.freq,
        )?;

        Ok(MjpegResponse {
            status: options.status,
            headers: options.headers,
            body: pump.spawn(self.channel_capacity),
        })
    }
}
