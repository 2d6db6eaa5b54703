//! Latest-frame MJPEG relay
//!
//! Producers push single images for named streams; viewers receive the most
//! recent image of a stream as a continuous `multipart/x-mixed-replace`
//! (MJPEG) response. Only the latest frame per stream is ever kept.
//!
//! - Lock-sharded latest-value [`FrameStore`] with per-stream atomic swaps
//! - [`FrameCodec`] normalising base64 / upload / raw inputs and rendering
//!   fixed-width JPEGs with the `image` crate
//! - One [`StreamPump`] task per viewer, paced by `tokio::time::interval` and
//!   stopped when the viewer disconnects
//! - axum HTTP surface in [`web`]
//!
//! # Example
//!
//! ```no_run
//! use mjpeg_relay::{FrameRelay, StreamOptions};
//! use mjpeg_relay::config::RelayConfig;
//!
//! # async fn demo(jpeg_b64: String) -> Result<(), mjpeg_relay::RelayError> {
//! let relay = FrameRelay::from_config(&RelayConfig::default());
//! relay.send_frame("cam1", jpeg_b64.into()).await?;
//! let response = relay.get_stream("cam1", StreamOptions::default().with_freq(10.0))?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod pump;
pub mod relay;
pub mod stats;
pub mod store;
pub mod web;

// Re-exports for convenience
pub use codec::{CanonicalPayload, CodecError, FrameCodec, FrameInput};
pub use pump::{MjpegStream, PumpError, StreamPump, TickOutcome};
pub use relay::{FrameRelay, MjpegResponse, RelayError, StreamOptions};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use store::{FrameStore, StoreError, StoreLimits, StoredFrame};
