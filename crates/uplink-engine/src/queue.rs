//! Bounded send queues between the encoder callback and the sender threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};
use uplink_encoder::{EncodedFrame, MediaKind};

/// What happens to a push that finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the incoming frame, unless it is a key unit, in which case
    /// everything queued is dropped and the key unit inserted.
    FlushOnKeyUnit,
    /// Drop the incoming frame.
    DropNewest,
}

/// Fixed-capacity frame queue for one media type.
///
/// `push` never blocks. One producer and one consumer are expected; with
/// more producers the key-unit flush may lose its slot to a racing push.
pub struct BoundedFrameQueue {
    kind: MediaKind,
    capacity: usize,
    policy: OverflowPolicy,
    tx: Sender<EncodedFrame>,
    rx: Receiver<EncodedFrame>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl BoundedFrameQueue {
    pub fn new(kind: MediaKind, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            kind,
            capacity,
            policy,
            tx,
            rx,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Video queue: key units flush the backlog.
    pub fn video(capacity: usize) -> Self {
        Self::new(MediaKind::Video, capacity, OverflowPolicy::FlushOnKeyUnit)
    }

    /// Audio queue: overflow drops the newest frame.
    pub fn audio(capacity: usize) -> Self {
        Self::new(MediaKind::Audio, capacity, OverflowPolicy::DropNewest)
    }

    /// Enqueue without blocking. Returns false if the frame was dropped.
    pub fn push(&self, frame: EncodedFrame) -> bool {
        let frame = match self.tx.try_send(frame) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => frame,
        };

        if self.policy == OverflowPolicy::FlushOnKeyUnit && frame.is_key_unit {
            let flushed = self.drain();
            self.dropped.fetch_add(flushed as u64, Ordering::Relaxed);
            debug!(kind = self.kind.as_str(), flushed, "Queue full, flushed backlog for key unit");

            return match self.tx.try_send(frame) {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            };
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(kind = self.kind.as_str(), "Queue full, dropped frame");
        false
    }

    /// Wait up to `timeout` for a frame.
    pub fn pop(&self, timeout: Duration) -> Option<EncodedFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Discard everything queued. Not counted as overflow drops.
    pub fn clear(&self) -> usize {
        self.drain()
    }

    fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Frames accepted since creation.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Frames lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
