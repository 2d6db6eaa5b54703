//! Latest-value frame store
//!
//! Keeps exactly one canonical frame per stream id. Producers overwrite the
//! frame, viewers read whatever is current; nothing is queued.
//!
//! # Locking
//!
//! ```text
//!   FrameStore
//!   ├── shard[0]: RwLock<HashMap<id, Arc<Slot>>>
//!   ├── shard[1]: ...
//!   └── shard[N]
//!                         Slot { frame: RwLock<StoredFrame> }
//! ```
//!
//! A shard write lock is only taken when an id is seen for the first time.
//! Updates to an existing id hold the shard read lock just long enough to clone
//! the slot `Arc`, then swap the whole `StoredFrame` under the slot lock. The
//! payload is a `Bytes` handle, so the critical section is a pointer swap and a
//! reader always sees one complete payload.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const SHARD_COUNT: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("stream limit of {0} reached")]
    CapacityExhausted(usize),
}

/// Limits applied by the store
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_streams: usize,
    pub max_frame_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Latest frame recorded for a stream
#[derive(Debug, Clone)]
pub struct StoredFrame {
    /// Canonical (base64 text) payload
    pub payload: Bytes,
    /// Update counter, 1 for the first frame of the stream
    pub seq: u64,
    pub updated_at: Instant,
}

#[derive(Debug)]
struct Slot {
    frame: RwLock<StoredFrame>,
}

/// Summary of a stored stream, used for listings
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub seq: u64,
    pub bytes: usize,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub streams: usize,
    pub upserts: u64,
}

/// Concurrent map from stream id to its latest frame
pub struct FrameStore {
    shards: Vec<RwLock<HashMap<String, Arc<Slot>>>>,
    limits: StoreLimits,
    stream_count: AtomicUsize,
    upserts: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    pub fn with_limits(limits: StoreLimits) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards,
            limits,
            stream_count: AtomicUsize::new(0),
            upserts: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    fn shard(&self, id: &str) -> &RwLock<HashMap<String, Arc<Slot>>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Create or replace the frame for `id`
    ///
    /// Returns the new sequence number. On error the existing frame (if any)
    /// is left untouched.
    pub fn upsert(&self, id: &str, payload: Bytes) -> Result<u64, StoreError> {
        if payload.len() > self.limits.max_frame_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: payload.len(),
                limit: self.limits.max_frame_bytes,
            });
        }

        let shard = self.shard(id);

        // Fast path: the stream already exists
        let existing = shard.read().get(id).cloned();
        let seq = match existing {
            Some(slot) => Self::replace(&slot, payload),
            None => {
                let mut map = shard.write();
                // Another writer may have inserted while we waited
                let raced = map.get(id).cloned();
                if let Some(slot) = raced {
                    drop(map);
                    Self::replace(&slot, payload)
                } else {
                    self.reserve_stream()?;
                    map.insert(
                        id.to_string(),
                        Arc::new(Slot {
                            frame: RwLock::new(StoredFrame {
                                payload,
                                seq: 1,
                                updated_at: Instant::now(),
                            }),
                        }),
                    );
                    info!(stream = %id, "New stream registered");
                    1
                }
            }
        };

        self.upserts.fetch_add(1, Ordering::Relaxed);
        debug!(stream = %id, seq, "Frame stored");
        Ok(seq)
    }

    fn replace(slot: &Slot, payload: Bytes) -> u64 {
        let mut frame = slot.frame.write();
        let seq = frame.seq + 1;
        *frame = StoredFrame {
            payload,
            seq,
            updated_at: Instant::now(),
        };
        seq
    }

    fn reserve_stream(&self) -> Result<(), StoreError> {
        let max = self.limits.max_streams;
        self.stream_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| StoreError::CapacityExhausted(max))
    }

    /// Latest frame for `id`, or `None` if nothing was ever sent
    pub fn get(&self, id: &str) -> Option<StoredFrame> {
        let slot = self.shard(id).read().get(id).cloned()?;
        let frame = slot.frame.read().clone();
        Some(frame)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shard(id).read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stream_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Known streams, sorted by id
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut out: Vec<StreamInfo> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(id, slot)| {
                        let frame = slot.frame.read();
                        StreamInfo {
                            id: id.clone(),
                            seq: frame.seq,
                            bytes: frame.payload.len(),
                            age_ms: frame.updated_at.elapsed().as_millis() as u64,
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            streams: self.len(),
            upserts: self.upserts.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
