//! Gapless playback of streamed audio chunks.
//!
//! Buffers are laid end to end on the output clock: the first one of a
//! playback session starts `lead_time` after now, every later one starts
//! where the previous one ends (or at now, if the output already passed that
//! point). Buffers further than `schedule_ahead` in the future wait in a
//! pending queue until [`PlaybackScheduler::poll`] moves them out.

use crate::audio::activity::PlaybackActivity;
use crate::audio::pcm::{AudioFrame, duration_to_samples};
use crate::defaults;
use crate::error::Result;
use crate::playback::output::{AudioOutput, PlaybackItem, apply_envelope};
use crate::session::cancellation::Interruptible;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Offset of the first buffer of a session from now.
    pub lead_time: Duration,
    /// Linear fade applied to both ends of each buffer.
    pub fade: Duration,
    /// How far ahead of now buffers are handed to the output.
    pub schedule_ahead: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            lead_time: Duration::from_millis(defaults::LEAD_TIME_MS),
            fade: Duration::from_millis(defaults::FADE_MS),
            schedule_ahead: Duration::from_millis(defaults::SCHEDULE_AHEAD_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The output clock passed the start of the session's first buffer.
    FirstAudioStart,
    /// Every buffer of the session has finished playing.
    AllAudioFinished,
    /// The session was stopped before it finished.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Streamed,
    SingleShot,
}

#[derive(Debug)]
struct PlaybackSession {
    mode: Mode,
    first_start: Option<Duration>,
    started: bool,
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    config: PlaybackConfig,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    activity: PlaybackActivity,
    pending: VecDeque<AudioFrame>,
    /// End times of buffers handed to the output and not yet finished.
    scheduled: VecDeque<Duration>,
    next_start: Option<Duration>,
    session: Option<PlaybackSession>,
    next_id: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, config: PlaybackConfig) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            output,
            config,
            events,
            activity: PlaybackActivity::new(),
            pending: VecDeque::new(),
            scheduled: VecDeque::new(),
            next_start: None,
            session: None,
            next_id: 0,
        };
        (scheduler, rx)
    }

    /// Shares the "playback audible" flag with the capture gate.
    pub fn with_activity(mut self, activity: PlaybackActivity) -> Self {
        self.activity = activity;
        self
    }

    pub fn activity(&self) -> &PlaybackActivity {
        &self.activity
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Buffers waiting to be handed to the output.
    pub fn queue_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffers handed to the output that have not finished yet.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Queues a streamed chunk for gapless playback.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        if matches!(&self.session, Some(s) if s.mode == Mode::SingleShot) {
            tracing::debug!("Streamed audio replaces single-shot playback");
            self.stop();
        }
        self.ensure_session(Mode::Streamed);
        self.pending.push_back(frame);
        self.pump()
    }

    /// Plays one buffer on its own, stopping whatever is playing.
    pub fn play_once(&mut self, frame: AudioFrame) -> Result<()> {
        self.stop();
        if frame.is_empty() {
            return Ok(());
        }
        self.ensure_session(Mode::SingleShot);
        self.schedule_frame(frame)
    }

    /// Halts everything, clears the queue and returns to idle.
    pub fn stop(&mut self) {
        let pending = self.pending.len();
        let scheduled = self.scheduled.len();
        self.output.halt();
        self.pending.clear();
        self.scheduled.clear();
        self.next_start = None;
        if self.session.take().is_some() {
            self.activity.set_playing(false);
            tracing::debug!(pending, scheduled, "Playback cancelled");
            self.emit(PlaybackEvent::Cancelled);
        }
    }

    /// Drops pending buffers but lets scheduled ones play out.
    pub fn flush_queue_only(&mut self) {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Flushed pending playback queue");
        }
    }

    /// Advances the scheduler against the output clock.
    ///
    /// Hands due buffers to the output, retires finished ones and fires
    /// session events. Call regularly (every few tens of milliseconds).
    pub fn poll(&mut self) -> Result<()> {
        self.pump()?;
        let now = self.output.now();

        if let Some(session) = self.session.as_mut()
            && !session.started
            && let Some(first) = session.first_start
            && now >= first
        {
            session.started = true;
            self.emit(PlaybackEvent::FirstAudioStart);
        }

        while matches!(self.scheduled.front(), Some(&end) if end <= now) {
            self.scheduled.pop_front();
        }

        if self.session.is_some() && self.scheduled.is_empty() && self.pending.is_empty() {
            self.session = None;
            self.next_start = None;
            self.activity.set_playing(false);
            tracing::debug!("Playback finished");
            self.emit(PlaybackEvent::AllAudioFinished);
        }
        Ok(())
    }

    fn ensure_session(&mut self, mode: Mode) {
        if self.session.is_none() {
            self.session = Some(PlaybackSession {
                mode,
                first_start: None,
                started: false,
            });
            self.activity.set_playing(true);
        }
    }

    fn pump(&mut self) -> Result<()> {
        let horizon = self.output.now() + self.config.schedule_ahead;
        while !self.pending.is_empty() {
            if self.start_for_next() > horizon {
                break;
            }
            let Some(frame) = self.pending.pop_front() else {
                break;
            };
            self.schedule_frame(frame)?;
        }
        Ok(())
    }

    fn start_for_next(&self) -> Duration {
        let now = self.output.now();
        match self.next_start {
            Some(next) => next.max(now),
            None => now + self.config.lead_time,
        }
    }

    fn schedule_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let start = self.start_for_next();
        if let Some(next) = self.next_start
            && start > next
        {
            tracing::debug!(
                late_ms = (start - next).as_millis() as u64,
                "Output clock passed next start, playing late"
            );
        }

        let mut samples = frame.samples();
        let fade_samples = duration_to_samples(self.config.fade, self.config.sample_rate) as usize;
        apply_envelope(&mut samples, fade_samples);

        let item = PlaybackItem {
            id: self.next_id,
            start,
            samples,
            sample_rate: self.config.sample_rate,
        };
        self.next_id += 1;
        let end = item.end();
        self.output.schedule(item)?;

        self.scheduled.push_back(end);
        self.next_start = Some(end);
        if let Some(session) = self.session.as_mut()
            && session.first_start.is_none()
        {
            session.first_start = Some(start);
        }
        Ok(())
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(?event, "Playback event dropped, no listener");
        }
    }
}

impl<O: AudioOutput> Interruptible for PlaybackScheduler<O> {
    fn interrupt(&mut self) {
        self.stop();
    }
}
