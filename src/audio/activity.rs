//! Shared "local playback is audible" flag.
//!
//! The playback scheduler raises it while a playback session is active; the
//! capture gate reads it to raise its energy floor against speaker bleed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct PlaybackActivity {
    playing: Arc<AtomicBool>,
}

impl PlaybackActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_playing(&self, playing: bool) {
        let was = self.playing.swap(playing, Ordering::SeqCst);
        if was != playing {
            tracing::trace!(playing, "Playback activity changed");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_playing() {
        assert!(!PlaybackActivity::new().is_playing());
    }

    #[test]
    fn test_clone_shares_state() {
        let a = PlaybackActivity::new();
        let b = a.clone();

        a.set_playing(true);
        assert!(b.is_playing());

        b.set_playing(false);
        assert!(!a.is_playing());
    }
}
