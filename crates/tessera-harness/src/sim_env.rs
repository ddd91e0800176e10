//! Simulated environment: seeded randomness and a virtual clock.
//!
//! Both clocks move only when a test calls [`SimEnv::advance`], so prekey
//! rotation and session expiry happen exactly when a scenario says they do.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tessera_core::Environment;

/// Wall clock a fresh [`SimEnv`] starts at (2023-11-14T22:13:20Z).
pub const SIM_EPOCH_SECS: u64 = 1_700_000_000;

/// Point on the virtual monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Deterministic environment for simulation.
///
/// Clones share the RNG and the clock: every manager of a simulation sees
/// the same time, and a run is fully determined by its seed and the order of
/// events.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Mutex<SimState>>,
}

struct SimState {
    rng: ChaCha20Rng,
    elapsed: Duration,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// Move the virtual clocks forward.
    pub fn advance(&self, duration: Duration) {
        self.inner.lock().expect("Mutex poisoned").elapsed += duration;
    }

    /// Move the virtual clocks forward by whole days.
    pub fn advance_days(&self, days: u64) {
        self.advance(Duration::from_secs(days * 24 * 60 * 60));
    }

    /// Time elapsed since the simulation started.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().expect("Mutex poisoned").elapsed
    }

    /// Pick an index in `0..len` from the simulation RNG.
    pub fn pick(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        (self.random_u64() % len as u64) as usize
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> Self::Instant {
        SimInstant(self.elapsed())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.lock().expect("Mutex poisoned").rng.fill_bytes(buffer);
    }

    fn wall_clock_secs(&self) -> u64 {
        SIM_EPOCH_SECS + self.elapsed().as_secs()
    }
}
