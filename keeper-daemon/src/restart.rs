//! Restart decisions.
//!
//! The engine is a pure function of the unit's policy and its recent exit
//! history. Scheduling the relaunch is the supervisor's job.

use std::collections::VecDeque;
use std::time::Duration;

use keeper_core::{RestartPolicy, RestartSettings};
use tokio::time::Instant;

/// Upper bound on remembered exits; older entries fall outside any window
/// that matters for backoff.
const MAX_REMEMBERED_EXITS: usize = 64;

/// Doubling stops here so the multiplier never overflows.
const MAX_BACKOFF_SHIFT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    RestartAfter(Duration),
    DoNotRestart,
}

/// Timestamps of recent unexpected exits, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ExitHistory {
    exits: VecDeque<Instant>,
}

impl ExitHistory {
    pub fn record(&mut self, at: Instant) {
        self.exits.push_back(at);
        while self.exits.len() > MAX_REMEMBERED_EXITS {
            self.exits.pop_front();
        }
    }

    /// Exits no older than `window` at `now`.
    pub fn recent(&self, now: Instant, window: Duration) -> usize {
        self.exits
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count()
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartEngine {
    window: Duration,
    base_delay: Duration,
    max_delay: Duration,
}

impl RestartEngine {
    pub fn new(window: Duration, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            base_delay,
            max_delay,
        }
    }

    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self::new(
            settings.window(),
            settings.base_delay(),
            settings.max_delay(),
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Decide what to do after an exit that has already been recorded in
    /// `history`.
    ///
    /// The first exit inside the window restarts immediately; every further
    /// one doubles the delay starting at `base_delay`, capped at `max_delay`.
    pub fn decide(
        &self,
        policy: RestartPolicy,
        history: &ExitHistory,
        now: Instant,
    ) -> RestartDecision {
        match policy {
            RestartPolicy::Never | RestartPolicy::DisabledTemporarily => {
                RestartDecision::DoNotRestart
            }
            RestartPolicy::Always => {
                let recent = history.recent(now, self.window);
                if recent <= 1 {
                    return RestartDecision::RestartNow;
                }
                let shift = u32::try_from(recent - 2)
                    .unwrap_or(MAX_BACKOFF_SHIFT)
                    .min(MAX_BACKOFF_SHIFT);
                let delay = self
                    .base_delay
                    .saturating_mul(1u32 << shift)
                    .min(self.max_delay);
                RestartDecision::RestartAfter(delay)
            }
        }
    }
}
