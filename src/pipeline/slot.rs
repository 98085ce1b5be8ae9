//! Single-slot "latest frame wins" hand-off between the driver and the worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TryRecvError, TrySendError};

use crate::capture::Frame;

/// Result of a blocking claim
#[derive(Debug)]
pub enum Claim {
    Frame(Frame),
    /// The slot was shut down; the consumer should exit
    Stopped,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    claimed: AtomicU64,
    dropped: AtomicU64,
}

/// Holds at most one unclaimed frame.
///
/// Backed by a capacity-1 flume channel. Publishing into a full slot evicts
/// the pending frame, so a slow consumer never builds a backlog. Dropping
/// the sender on shutdown disconnects the channel, which is the stop signal
/// for blocked consumers.
pub struct FrameSlot {
    /// Producer side. Held under this lock only to keep evict-then-send
    /// atomic against other producers; consumers never take it.
    tx: Mutex<Option<Sender<Frame>>>,
    rx: Receiver<Frame>,
    stats: CachePadded<Stats>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Replace any unclaimed frame with `frame`. Never blocks on the consumer.
    ///
    /// Frames published after shutdown are dropped.
    pub fn publish(&self, frame: Frame) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return;
        };

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_published").increment(1);

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Only consumers remove from the channel, so after evicting
                // under the producer lock the slot is guaranteed empty.
                if self.rx.try_recv().is_ok() {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("camsource_frames_dropped").increment(1);
                }
                let _ = tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Block until a frame is available or the slot is shut down
    pub fn claim_blocking(&self) -> Claim {
        match self.rx.recv() {
            Ok(frame) => {
                self.stats.claimed.fetch_add(1, Ordering::Relaxed);
                Claim::Frame(frame)
            }
            Err(_) => Claim::Stopped,
        }
    }

    /// Mark the slot inactive, drop any pending frame and wake every waiter.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            return;
        }

        // Drain before disconnecting: flume still hands queued frames to
        // receivers after the last sender is gone
        loop {
            match self.rx.try_recv() {
                Ok(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        guard.take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// (published, claimed, dropped)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.published.load(Ordering::Relaxed),
            self.stats.claimed.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
