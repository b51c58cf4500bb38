//! Progress notifications and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Progress of a running explanation, sent after every evaluated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Number of masks evaluated so far.
    pub masks_processed: usize,
    /// Number of masks in the run.
    pub masks_total: usize,
}

impl ProgressEvent {
    /// Progress as a fraction (0.0 to 1.0).
    pub fn fraction(&self) -> f32 {
        if self.masks_total == 0 {
            return 1.0;
        }
        self.masks_processed as f32 / self.masks_total as f32
    }
}

/// Sending half of a progress channel.
///
/// Sending never blocks, and a dropped receiver is not an error: progress is
/// informational and never changes the outcome of a run.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    inner: Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Send a progress event.
    pub fn notify(&self, masks_processed: usize, masks_total: usize) {
        let _ = self.inner.send(ProgressEvent {
            masks_processed,
            masks_total,
        });
    }
}

/// Create a progress channel.
///
/// # Example
///
/// ```rust
/// use distex_explain::progress_channel;
///
/// let (sender, receiver) = progress_channel();
/// sender.notify(10, 100);
/// let event = receiver.try_recv().unwrap();
/// assert_eq!(event.masks_processed, 10);
/// ```
pub fn progress_channel() -> (ProgressSender, Receiver<ProgressEvent>) {
    let (inner, receiver) = mpsc::channel();
    (ProgressSender { inner }, receiver)
}

/// Shared flag asking a running explanation to stop after its current batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
