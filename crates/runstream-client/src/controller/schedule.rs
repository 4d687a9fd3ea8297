use std::time::Duration;

use tokio::time::Instant;

/// When buffered tokens are applied to the run state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushSchedule {
    /// Once per frame tick, at most one update per interval.
    Frame(Duration),
    /// On the next turn of the driving loop.
    Microtask,
}

impl FlushSchedule {
    /// Uses the frame clock when one exists and the caller has not asked for
    /// reduced motion.
    pub fn select(frame_clock: bool, reduced_motion: bool, interval: Duration) -> Self {
        if frame_clock && !reduced_motion && !interval.is_zero() {
            Self::Frame(interval)
        } else {
            Self::Microtask
        }
    }

    pub(crate) fn deadline(&self, now: Instant) -> Instant {
        match self {
            Self::Frame(interval) => now + *interval,
            Self::Microtask => now,
        }
    }
}

/// Tokens received since the last flush.
#[derive(Debug, Default)]
pub(crate) struct TokenBuffer {
    pub(crate) text: String,
    pub(crate) tokens: u64,
    pub(crate) first_token_ms: Option<u64>,
}

impl TokenBuffer {
    pub(crate) fn push(&mut self, text: &str, elapsed_ms: Option<u64>) {
        self.text.push_str(text);
        self.tokens += 1;
        if self.first_token_ms.is_none() {
            self.first_token_ms = elapsed_ms;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tokens == 0
    }

    pub(crate) fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}
