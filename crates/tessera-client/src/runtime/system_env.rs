//! Environment backed by the operating system.
//!
//! Keys, seeds and ratchet randomness come from `getrandom`; prekey ages and
//! session limbo are measured against the system wall clock.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tessera_core::Environment;

/// Operating-system clock and randomness, with tokio timers.
///
/// # Panics
///
/// Panics if the OS RNG fails. Without working randomness no key this
/// manager generates would be secret.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    /// A clock set before 1970 reads as the epoch, which only makes every
    /// prekey and stale session look fresh.
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs())
    }
}
