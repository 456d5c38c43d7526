//! Wall-clock deadlines for the message pump
//!
//! A [`Deadline`] is fixed at creation so that a wait loop which pumps many
//! messages still expires relative to the original call site. Sub-deadlines
//! derived with [`Deadline::bounded`] never outlive their parent.

use std::time::Duration;
use tokio::time::Instant;

/// A fixed point in time a wait must not run past.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    duration: Duration,
}

impl Deadline {
    /// Deadline `duration` from now.
    pub fn new(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
            duration,
        }
    }

    /// Deadline `duration` from now, clamped to `outer`.
    ///
    /// Used by the event loop's predicate re-poll interval: the sub-wait may
    /// expire early so the predicate runs again, but it can never overrun
    /// the caller's deadline.
    pub fn bounded(duration: Duration, outer: &Deadline) -> Self {
        let at = (Instant::now() + duration).min(outer.at);
        Self { at, duration }
    }

    /// An already-expired deadline; receive calls drain buffered frames
    /// without blocking.
    pub fn zero() -> Self {
        Self::new(Duration::ZERO)
    }

    /// The instant this deadline expires.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The duration this deadline was created with, for error messages.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}
