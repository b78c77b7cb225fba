//! Client-side audio context (wall clock and timezone) sent alongside speech.

use chrono::{DateTime, Local, Offset, TimeZone};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioContext {
    /// Local date and time at minute resolution (`YYYY-MM-DD HH:MM`).
    pub datetime: String,
    pub timezone: String,
    /// Full client timestamp (RFC 3339).
    pub client_datetime: String,
}

impl AudioContext {
    pub fn now() -> Self {
        Self::at(&Local::now())
    }

    pub fn at<Tz: TimeZone>(time: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let timezone = std::env::var("TZ")
            .ok()
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(|| time.offset().fix().to_string());
        Self {
            datetime: time.format("%Y-%m-%d %H:%M").to_string(),
            timezone,
            client_datetime: time.to_rfc3339(),
        }
    }

    /// Identity used to decide whether the context changed.
    fn fingerprint(&self) -> (&str, &str) {
        (&self.datetime, &self.timezone)
    }
}

/// Remembers the last context sent so that unchanged ones are skipped.
#[derive(Debug, Default)]
pub struct ContextTracker {
    last: Option<AudioContext>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `context` if it differs from the last one returned.
    pub fn observe(&mut self, context: AudioContext) -> Option<AudioContext> {
        if let Some(last) = &self.last
            && last.fingerprint() == context.fingerprint()
        {
            return None;
        }
        self.last = Some(context.clone());
        Some(context)
    }

    /// Forgets the last context, e.g. after reconnecting.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
