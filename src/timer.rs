use std::time::Duration;

use tokio::time::Instant;

use crate::svc::SvcKey;

/// Timers the supervisor arms and reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKey {
    /// STOPPING record's SIGTERM deadline; SIGKILL on expiry.
    KillDeadline(SvcKey),
    /// CRASHED record may try again.
    Backoff(SvcKey),
    /// Bounded grace for a runlevel transition's stop phase.
    RunlevelGrace,
}

/// Small deadline queue over tokio time. Arming an already-armed key
/// replaces its deadline; the record count is tiny so a sorted scan is
/// all this needs.
#[derive(Default)]
pub struct TimerQueue {
    deadlines: Vec<(Instant, TimerKey)>,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            deadlines: Vec::new(),
        }
    }

    pub fn arm(&mut self, key: TimerKey, after: Duration) {
        self.cancel(&key);
        self.deadlines.push((Instant::now() + after, key));
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        self.deadlines.retain(|(_, k)| k != key);
    }

    /// Drop every timer referring to the given record.
    pub fn cancel_svc(&mut self, key: &SvcKey) {
        self.deadlines.retain(|(_, k)| match k {
            TimerKey::KillDeadline(s) | TimerKey::Backoff(s) => s != key,
            _ => true,
        });
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.deadlines.iter().any(|(_, k)| k == key)
    }

    /// Wait for the earliest deadline and pop it. Pends forever while the
    /// queue is empty so it can sit in a select arm.
    pub async fn next_expired(&mut self) -> TimerKey {
        let (at, idx) = match self
            .deadlines
            .iter()
            .enumerate()
            .min_by_key(|(_, (at, _))| *at)
        {
            Some((idx, (at, _))) => (*at, idx),
            None => return std::future::pending().await,
        };

        tokio::time::sleep_until(at).await;
        self.deadlines.remove(idx).1
    }
}
