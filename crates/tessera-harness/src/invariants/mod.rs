//! Properties every simulated run must satisfy, whatever the delivery order.
//!
//! Scenario tests pin down one interleaving of server answers; the checks here
//! state what must hold for all of them. [`SimNetwork::snapshot`] captures
//! what the managers expose (completions, outstanding fetches) into a
//! [`SystemSnapshot`] and an [`InvariantRegistry`] runs its checks over it.
//!
//! ```ignore
//! network.deliver_all_in(DeliveryOrder::Reverse);
//! InvariantRegistry::standard().assert_all(&network.snapshot(), "after delivery");
//! ```
//!
//! [`SimNetwork::snapshot`]: crate::SimNetwork::snapshot

mod checks;
mod snapshot;

use std::fmt;

pub use checks::{CompletedOnce, EncryptionOrder, SingleFetchPerPeer};
pub use snapshot::{NodeSnapshot, SystemSnapshot};

/// Outcome of one invariant check.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant, with the node and request that broke it in `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the broken invariant.
    pub invariant: &'static str,
    /// What was observed.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a [`SystemSnapshot`].
pub trait Invariant: Send + Sync {
    /// Short name used in violation reports.
    fn name(&self) -> &'static str;

    /// Check the property, reporting the first counterexample.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Ordered set of invariants run together.
#[derive(Default)]
pub struct InvariantRegistry {
    checks: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Registry without any check.
    pub fn new() -> Self {
        Self::default()
    }

    /// The checks every manager simulation should pass: [`CompletedOnce`],
    /// [`EncryptionOrder`] and [`SingleFetchPerPeer`].
    pub fn standard() -> Self {
        Self::new().with(CompletedOnce).with(EncryptionOrder).with(SingleFetchPerPeer)
    }

    /// Append a check.
    #[must_use]
    pub fn with<I: Invariant + 'static>(mut self, invariant: I) -> Self {
        self.checks.push(Box::new(invariant));
        self
    }

    /// Names of the registered checks, in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    /// Run every check and collect the violations.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<Violation> =
            self.checks.iter().filter_map(|check| check.check(state).err()).collect();
        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every check and panic listing all violations.
    #[allow(clippy::panic, reason = "test assertion helper")]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        let Err(violations) = self.check_all(state) else {
            return;
        };
        let report: Vec<String> = violations.iter().map(ToString::to_string).collect();
        panic!("{} invariant(s) broken {context}:\n  {}", report.len(), report.join("\n  "));
    }
}
