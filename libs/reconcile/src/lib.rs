//! Convergence primitives.
//!
//! Shared by the control plane (which judges whether an agent has converged)
//! and the node agent (which decides whether a fetched configuration needs
//! to be applied). Key concepts:
//!
//! - **Desired configuration**: the WireGuard config the control plane holds.
//! - **Applied configuration**: what the agent last wrote and brought up.
//! - **Convergence**: the agent reports a [`ConfigHash`] equal to the hash of
//!   the desired configuration.
//!
//! # Invariants
//!
//! - Hashing is deterministic; the same text always yields the same hash.
//! - An empty configuration has no hash and is never applied.
//! - [`Backoff`] delays are non-decreasing and never exceed the cap.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default period of the agent's poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between polls of a provider long-running operation.
pub const DEFAULT_OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// SHA-256 content hash of a configuration text, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    /// Hash a configuration text.
    ///
    /// Returns `None` for an empty (or whitespace-only) configuration: there
    /// is nothing to apply, so there is nothing to converge to.
    pub fn of(config: &str) -> Option<Self> {
        if config.trim().is_empty() {
            return None;
        }
        let digest = Sha256::digest(config.as_bytes());
        Some(Self(hex::encode(digest)))
    }

    /// Wrap a hash string reported by a peer.
    ///
    /// Returns `None` for an empty string, which agents report before their
    /// first successful apply.
    pub fn from_reported(hash: &str) -> Option<Self> {
        let hash = hash.trim();
        if hash.is_empty() {
            None
        } else {
            Some(Self(hash.to_ascii_lowercase()))
        }
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exponential backoff with a cap.
///
/// Each call to [`Backoff::next_delay`] returns the current delay and doubles
/// it for the next call, saturating at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// The delay to sleep now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}

/// A fixed point in time after which a bounded wait gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Time since the deadline was armed.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The configured budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// True once more than the budget has elapsed.
    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.budget
    }
}
