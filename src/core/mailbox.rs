//! # Frame Mailbox
//!
//! Single-slot rendezvous between the producer (whoever calls `feed`) and the
//! pump thread.
//!
//! ```text
//! ┌─────────────────┐  put / feed   ┌─────────────────┐     take      ┌─────────────────┐
//! │    Producer     │──────────────▶│   FrameMailbox  │──────────────▶│    FramePump    │
//! │ (caller thread) │  overwrites   │   [ one slot ]  │ blocks until  │  (pump thread)  │
//! └─────────────────┘  never waits  └─────────────────┘ data or close └─────────────────┘
//! ```
//!
//! The producer always wins: a frame that was not taken yet is overwritten, so
//! a slow consumer only ever sees the most recent frame and memory stays
//! bounded to one frame plus one spare allocation.
//!
//! `close()` wakes every waiter and makes `take()` return
//! `Delivery::EndOfStream` from then on, so shutdown cannot hang on the
//! condition variable.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::caps::RotationMode;
use crate::error::StreamerResult;
use crate::frame::{Frame, Geometry};

/// Counters describing what went through the mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    /// Frames deposited by the producer
    pub fed: u64,
    /// Frames handed to the consumer
    pub taken: u64,
    /// Frames discarded because a newer one arrived before `take`
    pub overwritten: u64,
}

/// A frame together with the changes the pump must apply before forwarding it.
#[derive(Debug)]
pub struct Handoff {
    pub frame: Frame,
    /// Set when the geometry differs from the previously deposited frame
    pub resized: Option<Geometry>,
    /// Set when the rotation changed since the previous take
    pub rotation: Option<RotationMode>,
}

/// Result of a blocking [`FrameMailbox::take`].
#[derive(Debug)]
pub enum Delivery {
    Frame(Handoff),
    /// The mailbox was closed; no further frames will be delivered
    EndOfStream,
}

#[derive(Debug, Default)]
struct MailboxState {
    slot: Option<Frame>,
    /// Allocation kept from a discarded frame, reused by the next `feed`
    spare: Option<Vec<u8>>,
    last_geometry: Option<Geometry>,
    pending_resize: Option<Geometry>,
    rotation: RotationMode,
    pending_rotation: Option<RotationMode>,
    closed: bool,
    stats: MailboxStats,
}

#[derive(Debug, Default)]
pub struct FrameMailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl FrameMailbox {
    pub fn new(rotation: RotationMode) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                rotation,
                ..MailboxState::default()
            }),
            ready: Condvar::new(),
        }
    }

    /// Copy `bytes` into the slot, reusing the unconsumed frame's buffer or the
    /// spare allocation when the byte length matches.
    ///
    /// Invalid input is rejected before the lock is taken and leaves the
    /// mailbox untouched.
    pub fn feed(&self, width: u32, height: u32, bytes: &[u8]) -> StreamerResult<()> {
        let geometry = Geometry::new(width, height).ensure_non_empty("feed")?;
        if bytes.len() != geometry.rgb_len() {
            return Err(crate::error::StreamerError::validation(
                "feed.bytes",
                format!("length must be {} for {} RGB24", geometry.rgb_len(), geometry),
                bytes.len().to_string(),
            ));
        }

        let mut state = self.lock();
        if state.closed {
            log::debug!("Mailbox closed, dropping {} frame", geometry);
            return Ok(());
        }
        Self::note_geometry(&mut state, geometry);
        match state.slot.as_mut() {
            Some(unconsumed) => {
                unconsumed.overwrite(geometry, bytes);
                state.stats.overwritten += 1;
            }
            None => {
                let buffer = state.spare.take().unwrap_or_default();
                state.slot = Some(Frame::from_recycled(geometry, buffer, bytes));
            }
        }
        state.stats.fed += 1;
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Store an owned frame, discarding any unconsumed one.
    pub fn put(&self, frame: Frame) {
        let mut state = self.lock();
        if state.closed {
            log::debug!("Mailbox closed, dropping {} frame", frame.geometry());
            return;
        }
        Self::note_geometry(&mut state, frame.geometry());
        if let Some(previous) = state.slot.replace(frame) {
            state.stats.overwritten += 1;
            if state.spare.is_none() {
                state.spare = Some(previous.into_bytes());
            }
        }
        state.stats.fed += 1;
        drop(state);
        self.ready.notify_one();
    }

    /// Block until a frame is available or the mailbox is closed.
    pub fn take(&self) -> Delivery {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Delivery::EndOfStream;
            }
            if let Some(frame) = state.slot.take() {
                state.stats.taken += 1;
                return Delivery::Frame(Handoff {
                    frame,
                    resized: state.pending_resize.take(),
                    rotation: state.pending_rotation.take(),
                });
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Non-blocking variant of [`take`](Self::take); `None` when the slot is empty.
    pub fn try_take(&self) -> Option<Delivery> {
        let mut state = self.lock();
        if state.closed {
            return Some(Delivery::EndOfStream);
        }
        let frame = state.slot.take()?;
        state.stats.taken += 1;
        Some(Delivery::Frame(Handoff {
            frame,
            resized: state.pending_resize.take(),
            rotation: state.pending_rotation.take(),
        }))
    }

    /// Record a rotation change for the next cycle. Idempotent.
    pub fn set_rotation(&self, mode: RotationMode) {
        let mut state = self.lock();
        if state.rotation != mode {
            state.rotation = mode;
            state.pending_rotation = Some(mode);
        }
    }

    /// Rotation change not yet picked up by a `take`. Used by pull-mode pumps,
    /// which never take frames from the slot.
    pub fn take_pending_rotation(&self) -> Option<RotationMode> {
        self.lock().pending_rotation.take()
    }

    /// Hand back an allocation the consumer no longer needs.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let mut state = self.lock();
        if state.spare.is_none() && !state.closed {
            state.spare = Some(buffer);
        }
    }

    /// Wait until the mailbox is closed or `timeout` elapses. Returns `true`
    /// when closed. The pump sleeps through this between paced frames.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed
    }

    /// Wake every waiter and refuse further frames.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.slot = None;
        state.spare = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> MailboxStats {
        self.lock().stats
    }

    fn note_geometry(state: &mut MailboxState, geometry: Geometry) {
        if state.last_geometry != Some(geometry) {
            state.last_geometry = Some(geometry);
            state.pending_resize = Some(geometry);
        }
    }

    // A panic while holding the lock cannot leave the slot half-written in a
    // way later calls would misread, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn expect_frame(delivery: Delivery) -> Handoff {
        match delivery {
            Delivery::Frame(handoff) => handoff,
            Delivery::EndOfStream => panic!("expected a frame, got end of stream"),
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let mailbox = FrameMailbox::default();
        for value in 1..=5u8 {
            mailbox.feed(2, 2, &[value; 12]).unwrap();
        }
        let handoff = expect_frame(mailbox.take());
        assert!(handoff.frame.as_bytes().iter().all(|&b| b == 5));

        let stats = mailbox.stats();
        assert_eq!(stats.fed, 5);
        assert_eq!(stats.taken, 1);
        assert_eq!(stats.overwritten, 4);
    }

    #[test]
    fn test_rejected_feed_leaves_state_untouched() {
        let mailbox = FrameMailbox::default();
        assert!(mailbox.feed(0, 2, &[]).is_err());
        assert!(mailbox.feed(2, 2, &[0; 11]).is_err());
        assert_eq!(mailbox.stats(), MailboxStats::default());
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn test_resize_is_reported_once() {
        let mailbox = FrameMailbox::default();
        mailbox.feed(2, 2, &[0; 12]).unwrap();
        let first = expect_frame(mailbox.take());
        assert_eq!(first.resized, Some(Geometry::new(2, 2)));

        mailbox.feed(2, 2, &[0; 12]).unwrap();
        assert_eq!(expect_frame(mailbox.take()).resized, None);

        mailbox.feed(4, 1, &[0; 12]).unwrap();
        let resized = expect_frame(mailbox.take());
        assert_eq!(resized.resized, Some(Geometry::new(4, 1)));
        assert_eq!(resized.frame.as_bytes().len(), 12);
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let mailbox = FrameMailbox::default();
        mailbox.feed(2, 2, &[1; 12]).unwrap();
        let frame = expect_frame(mailbox.take()).frame;
        let bytes = frame.into_bytes();
        let ptr = bytes.as_ptr();
        mailbox.recycle(bytes);

        mailbox.feed(2, 2, &[9; 12]).unwrap();
        let again = expect_frame(mailbox.take()).frame;
        assert_eq!(again.as_bytes().as_ptr(), ptr);
        assert!(again.as_bytes().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_close_wakes_blocked_take() {
        let mailbox = Arc::new(FrameMailbox::default());
        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.take())
        };
        thread::sleep(Duration::from_millis(50));
        mailbox.close();
        assert!(matches!(consumer.join().unwrap(), Delivery::EndOfStream));
        assert!(matches!(mailbox.take(), Delivery::EndOfStream));
    }

    #[test]
    fn test_rotation_pending_until_taken() {
        let mailbox = FrameMailbox::new(RotationMode::None);
        mailbox.set_rotation(RotationMode::None);
        assert_eq!(mailbox.take_pending_rotation(), None);

        mailbox.set_rotation(RotationMode::Rotate90);
        mailbox.feed(1, 1, &[0; 3]).unwrap();
        assert_eq!(
            expect_frame(mailbox.take()).rotation,
            Some(RotationMode::Rotate90)
        );
        assert_eq!(mailbox.take_pending_rotation(), None);
    }

    #[test]
    fn test_wait_closed_times_out() {
        let mailbox = FrameMailbox::default();
        assert!(!mailbox.wait_closed(Duration::from_millis(10)));
        mailbox.close();
        assert!(mailbox.wait_closed(Duration::from_secs(5)));
    }
}
