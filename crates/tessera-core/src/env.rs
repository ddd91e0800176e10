//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Enables
//! deterministic simulation (virtual clock, seeded RNG) and production use
//! with real system resources.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` and `wall_clock_secs()` never go backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, simulation
    /// environments a virtual instant.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - This method MUST return values that never decrease within a single
    ///   execution context. Subsequent calls must return times >= previous
    ///   calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by driver code (not protocol logic).
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch.
    ///
    /// Prekey rotation and session expiry compare persisted timestamps, so
    /// they need wall-clock time rather than `now()`.
    fn wall_clock_secs(&self) -> u64;

    /// Generates a random `u64`.
    ///
    /// This is a convenience method for common use cases like generating
    /// session IDs or request IDs.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u32`.
    ///
    /// Used for prekey ids.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// 32 random bytes, the seed size of every key pair.
    fn random_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }
}

/// Deterministic environment for unit tests.
pub mod test_utils {
    #![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Wall clock a fresh [`MockEnv`] starts at (2024-01-01T00:00:00Z).
    pub const MOCK_EPOCH_SECS: u64 = 1_704_067_200;

    /// Seeded RNG and a clock that only moves when told to.
    ///
    /// Clones share state, so a test can hand one clone to the code under
    /// test and advance time through another.
    #[derive(Clone)]
    pub struct MockEnv {
        inner: Arc<Mutex<MockState>>,
    }

    struct MockState {
        rng: ChaCha20Rng,
        base: Instant,
        elapsed: Duration,
    }

    impl MockEnv {
        /// Environment seeded with 0.
        pub fn new() -> Self {
            Self::with_seed(0)
        }

        /// Environment with a specific RNG seed.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                inner: Arc::new(Mutex::new(MockState {
                    rng: ChaCha20Rng::seed_from_u64(seed),
                    base: Instant::now(),
                    elapsed: Duration::ZERO,
                })),
            }
        }

        /// Move both clocks forward.
        pub fn advance(&self, duration: Duration) {
            self.inner.lock().expect("Mutex poisoned").elapsed += duration;
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Self::Instant {
            let state = self.inner.lock().expect("Mutex poisoned");
            state.base + state.elapsed
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.advance(duration);
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.inner.lock().expect("Mutex poisoned").rng.fill_bytes(buffer);
        }

        fn wall_clock_secs(&self) -> u64 {
            MOCK_EPOCH_SECS + self.inner.lock().expect("Mutex poisoned").elapsed.as_secs()
        }
    }

}
