//! Typing presence.
//!
//! Outbound, [`TypingDebouncer`] lets the first keystroke of a quiet window
//! through and suppresses the rest until the window has elapsed. Inbound,
//! [`TypingIndicator`] turns each peer `typing` signal into a deadline that
//! every new signal pushes back; the peer never says it stopped.

use std::time::Duration;

use tokio::time::Instant;

/// Leading-edge debounce for outbound typing signals.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    window: Duration,
    last_emit: Option<Instant>,
}

impl TypingDebouncer {
    /// Create a debouncer with the given window.
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
        }
    }

    /// Register a keystroke at `now`. Returns `true` if a signal should go out.
    pub fn keystroke(&mut self, now: Instant) -> bool {
        let open = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.window);
        if open {
            self.last_emit = Some(now);
        }
        open
    }

    /// Forget the last emission, e.g. after the message was sent.
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

/// Decaying "peer is typing" flag.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    expiry: Duration,
    until: Option<Instant>,
    /// Bumped on every signal so a stale expiry timer can tell it lost.
    generation: u64,
}

impl TypingIndicator {
    /// Create an indicator whose signals last `expiry`.
    #[must_use]
    pub const fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            until: None,
            generation: 0,
        }
    }

    /// Register a signal at `now`. Returns the generation the caller's
    /// expiry timer must present to [`expire`](Self::expire).
    pub fn signal(&mut self, now: Instant) -> u64 {
        self.until = Some(now + self.expiry);
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Clear the flag if no newer signal arrived since `generation`.
    ///
    /// Returns `true` if the flag went from set to clear.
    pub fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.until.is_none() {
            return false;
        }
        self.until = None;
        true
    }

    /// Clear the flag unconditionally (the peer's message arrived).
    ///
    /// Returns `true` if it was set.
    pub fn clear(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.until.take().is_some()
    }

    /// Whether the peer counts as typing at `now`.
    #[must_use]
    pub fn is_typing(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// The current deadline, if any.
    #[must_use]
    pub const fn until(&self) -> Option<Instant> {
        self.until
    }

    /// How long each signal lasts.
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        self.expiry
    }
}
