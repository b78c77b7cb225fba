//! Barge-in: aborting an in-flight response when the user starts talking.
//!
//! ```text
//!          begin_response()
//!   Idle ───────────────────▶ Responding
//!    ▲                            │
//!    └── barge_in / complete / ───┘
//!        disconnect
//! ```

use tokio_util::sync::CancellationToken;

/// Something that can be silenced immediately (local playback).
pub trait Interruptible {
    fn interrupt(&mut self);
}

/// Tells the remote side that the current response was abandoned.
pub trait PeerNotifier: Send + Sync {
    fn notify_barge_in(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Idle,
    Responding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeIn {
    /// A response was in flight and has been cancelled.
    Cancelled,
    /// Nothing to cancel.
    Ignored,
}

pub struct CancellationController {
    state: ResponseState,
    token: Option<CancellationToken>,
    notifier: Option<Box<dyn PeerNotifier>>,
    responses: u64,
    barge_ins: u64,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        Self {
            state: ResponseState::Idle,
            token: None,
            notifier: None,
            responses: 0,
            barge_ins: 0,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn PeerNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn is_responding(&self) -> bool {
        self.state == ResponseState::Responding
    }

    pub fn barge_in_count(&self) -> u64 {
        self.barge_ins
    }

    /// Starts a new response, cancelling any previous one.
    pub fn begin_response(&mut self) -> CancellationToken {
        if let Some(previous) = self.token.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.token = Some(token.clone());
        self.state = ResponseState::Responding;
        self.responses += 1;
        tracing::debug!(response = self.responses, "Response started");
        token
    }

    /// User speech arrived: cancel the response and silence playback.
    pub fn barge_in(&mut self, playback: Option<&mut dyn Interruptible>) -> BargeIn {
        if self.state != ResponseState::Responding {
            return BargeIn::Ignored;
        }

        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(playback) = playback {
            playback.interrupt();
        }
        self.state = ResponseState::Idle;
        self.barge_ins += 1;
        if let Some(notifier) = &self.notifier {
            notifier.notify_barge_in();
        }
        tracing::info!(response = self.responses, "Barge-in, response cancelled");
        BargeIn::Cancelled
    }

    /// The response finished on its own.
    pub fn complete(&mut self) {
        if self.state == ResponseState::Responding {
            self.token = None;
            self.state = ResponseState::Idle;
            tracing::debug!(response = self.responses, "Response complete");
        }
    }

    /// Transport lost: cancel everything.
    pub fn disconnect(&mut self, playback: Option<&mut dyn Interruptible>) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(playback) = playback {
            playback.interrupt();
        }
        self.state = ResponseState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakePlayback {
        interrupts: usize,
    }

    impl Interruptible for FakePlayback {
        fn interrupt(&mut self) {
            self.interrupts += 1;
        }
    }

    #[derive(Clone, Default)]
    struct CountingNotifier(Arc<AtomicUsize>);

    impl PeerNotifier for CountingNotifier {
        fn notify_barge_in(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_barge_in_while_idle_is_ignored() {
        let mut controller = CancellationController::new();
        let mut playback = FakePlayback::default();
        assert_eq!(controller.barge_in(Some(&mut playback)), BargeIn::Ignored);
        assert_eq!(playback.interrupts, 0);
    }

    #[test]
    fn test_barge_in_cancels_stops_and_notifies() {
        let notifier = CountingNotifier::default();
        let mut controller =
            CancellationController::new().with_notifier(Box::new(notifier.clone()));
        let mut playback = FakePlayback::default();

        let token = controller.begin_response();
        assert!(controller.is_responding());

        assert_eq!(controller.barge_in(Some(&mut playback)), BargeIn::Cancelled);
        assert!(token.is_cancelled());
        assert_eq!(playback.interrupts, 1);
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), ResponseState::Idle);

        // Second barge-in has nothing left to cancel
        assert_eq!(controller.barge_in(Some(&mut playback)), BargeIn::Ignored);
        assert_eq!(controller.barge_in_count(), 1);
    }

    #[test]
    fn test_new_response_cancels_previous_token() {
        let mut controller = CancellationController::new();
        let first = controller.begin_response();
        let second = controller.begin_response();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_complete_returns_to_idle_without_cancelling() {
        let mut controller = CancellationController::new();
        let token = controller.begin_response();
        controller.complete();
        assert_eq!(controller.state(), ResponseState::Idle);
        assert!(!token.is_cancelled());
        assert_eq!(controller.barge_in(None), BargeIn::Ignored);
    }

    #[test]
    fn test_disconnect_cancels_everything() {
        let mut controller = CancellationController::new();
        let mut playback = FakePlayback::default();
        let token = controller.begin_response();
        controller.disconnect(Some(&mut playback));
        assert!(token.is_cancelled());
        assert_eq!(playback.interrupts, 1);
        assert!(!controller.is_responding());
    }
}
