//! Mapper control surface shared with the tracking front-end.
//!
//! The keyframe queue is a mutex-guarded FIFO whose critical section also
//! covers the bundle-adjustment abort flag, so enqueueing a keyframe and
//! interrupting the running optimization are one atomic step. The remaining
//! flags are independent atomics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::system::NewKeyFrame;

/// Poll interval of the control loops.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(3);

struct QueueState {
    new_keyframes: VecDeque<NewKeyFrame>,
    abort_ba: bool,
}

/// Shared control handle of the local mapper.
///
/// The tracker holds a clone of the `Arc` and drives the mapper exclusively
/// through these methods; the mapper thread polls them at its safe points.
pub struct MapperControl {
    queue: Mutex<QueueState>,
    accept_keyframes: AtomicBool,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    not_stop: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,
    reset_requested: AtomicBool,
}

impl MapperControl {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState {
                new_keyframes: VecDeque::new(),
                abort_ba: false,
            }),
            accept_keyframes: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
            finish_requested: AtomicBool::new(false),
            finished: AtomicBool::new(true),
            reset_requested: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframe queue
    // ─────────────────────────────────────────────────────────────────────

    /// Enqueue a keyframe and interrupt any running bundle adjustment.
    pub fn insert_keyframe(&self, keyframe: NewKeyFrame) {
        let mut queue = self.queue.lock();
        queue.new_keyframes.push_back(keyframe);
        queue.abort_ba = true;
    }

    pub fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().new_keyframes.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().new_keyframes.len()
    }

    pub(crate) fn pop_keyframe(&self) -> Option<NewKeyFrame> {
        self.queue.lock().new_keyframes.pop_front()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bundle adjustment interruption
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the running bundle adjustment to bail out at its next check.
    pub fn interrupt_ba(&self) {
        self.queue.lock().abort_ba = true;
    }

    pub fn abort_ba(&self) -> bool {
        self.queue.lock().abort_ba
    }

    pub(crate) fn clear_abort_ba(&self) {
        self.queue.lock().abort_ba = false;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop / release
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the mapper to pause at its next safe point.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.queue.lock().abort_ba = true;
    }

    /// Called by the mapper at its safe point; transitions to stopped unless
    /// a `set_not_stop(true)` holds it running.
    pub fn stop(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) && !self.not_stop.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            info!("local mapping stopped");
            return true;
        }
        false
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resume after a stop. Keyframes queued while stopped are discarded.
    pub fn release(&self) {
        if self.is_finished() {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.queue.lock().new_keyframes.clear();
        info!("local mapping released");
    }

    /// Forbid stopping while the tracker inserts a keyframe it cannot lose.
    /// Fails when the mapper is already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        if flag && self.is_stopped() {
            return false;
        }
        self.not_stop.store(flag, Ordering::SeqCst);
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept flag (tracker flow control)
    // ─────────────────────────────────────────────────────────────────────

    pub fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, flag: bool) {
        self.accept_keyframes.store(flag, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset
    // ─────────────────────────────────────────────────────────────────────

    /// Request a reset and block until the mapper loop has honored it.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        while self.reset_requested.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub(crate) fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::SeqCst)
    }

    /// Mapper side: clear the queue and acknowledge the reset.
    pub(crate) fn complete_reset(&self) {
        self.queue.lock().new_keyframes.clear();
        self.reset_requested.store(false, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Finish
    // ─────────────────────────────────────────────────────────────────────

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self) {
        self.finished.store(false, Ordering::SeqCst);
    }

    /// Terminal transition: the mapper thread is exiting.
    pub(crate) fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Default for MapperControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CameraIntrinsics, Frame, ScalePyramid};
    use crate::geometry::Pose;

    fn empty_keyframe() -> NewKeyFrame {
        let frame = Frame::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0),
            ScalePyramid::default(),
            ScalePyramid::default(),
        )
        .unwrap();
        NewKeyFrame::untracked(Pose::identity(), frame)
    }

    #[test]
    fn insert_raises_abort_flag() {
        let control = MapperControl::new();
        assert!(!control.abort_ba());
        control.insert_keyframe(empty_keyframe());
        assert!(control.abort_ba());
        assert_eq!(control.queue_len(), 1);

        control.clear_abort_ba();
        assert!(!control.abort_ba());
        control.interrupt_ba();
        assert!(control.abort_ba());
    }

    #[test]
    fn stop_release_round_trip() {
        let control = MapperControl::new();
        control.set_running();

        // Without a request the safe point does not stop.
        assert!(!control.stop());

        control.request_stop();
        assert!(control.stop_requested());
        assert!(control.abort_ba());
        assert!(control.stop());
        assert!(control.is_stopped());

        // Keyframes queued while stopped are discarded by release.
        control.insert_keyframe(empty_keyframe());
        control.release();
        assert!(!control.is_stopped());
        assert!(!control.stop_requested());
        assert_eq!(control.queue_len(), 0);

        // The state is equivalent to a fresh handle.
        assert!(!control.stop());
    }

    #[test]
    fn not_stop_blocks_stop_transition() {
        let control = MapperControl::new();
        control.set_running();

        assert!(control.set_not_stop(true));
        control.request_stop();
        assert!(!control.stop());
        assert!(!control.is_stopped());

        assert!(control.set_not_stop(false));
        assert!(control.stop());

        // Cannot raise not_stop once stopped.
        assert!(!control.set_not_stop(true));
    }

    #[test]
    fn finish_transitions() {
        let control = MapperControl::new();
        assert!(control.is_finished());
        control.set_running();
        assert!(!control.is_finished());
        control.request_finish();
        assert!(control.finish_requested());
        control.set_finished();
        assert!(control.is_finished());
        assert!(control.is_stopped());
    }
}
