//! Runtime invariants of the session lifecycle, with contract-test support.
//!
//! Library code states an [`Invariant`] with [`assert_invariant!`]. Each
//! check is counted per thread, so a test can prove that the code path it
//! drove actually verified the invariants it depends on.
//!
//! ```rust,ignore
//! use becam::invariant_ppt::{contract_test, Invariant};
//!
//! assert_invariant!(
//!     negotiated.is_valid(),
//!     Invariant::NegotiatedConfigValid,
//!     "manager::open"
//! );
//!
//! #[test]
//! fn contract_open() {
//!     // ... open a session on this thread ...
//!     contract_test("open", &[Invariant::NegotiatedConfigValid]);
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::thread_local;

/// Properties the matcher and session manager promise to uphold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Invariant {
    /// A selected config always comes from the device's candidate list.
    SelectionIsCandidate,
    /// No device handle is opened while an earlier one is still held.
    SingleLiveHandle,
    /// A session only records a negotiated config with non-zero
    /// resolution and frame rate.
    NegotiatedConfigValid,
}

impl Invariant {
    pub const ALL: [Invariant; 3] = [
        Invariant::SelectionIsCandidate,
        Invariant::SingleLiveHandle,
        Invariant::NegotiatedConfigValid,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Invariant::SelectionIsCandidate => "Selected config is one of the available candidates",
            Invariant::SingleLiveHandle => "Previous device handle released before a new open",
            Invariant::NegotiatedConfigValid => "Negotiated config has non-zero resolution and fps",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

thread_local! {
    static CHECK_COUNTS: RefCell<HashMap<Invariant, u32>> = RefCell::new(HashMap::new());
}

/// Assert an [`Invariant`] and count the check.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $invariant:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $invariant, None)
    };
    ($condition:expr, $invariant:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $invariant, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, invariant: Invariant, context: Option<&str>) {
    CHECK_COUNTS.with(|counts| {
        *counts.borrow_mut().entry(invariant).or_insert(0) += 1;
    });

    if !condition {
        panic!(
            "INVARIANT VIOLATION [{}]: {}",
            context.unwrap_or("unknown"),
            invariant
        );
    }
}

/// How many times `invariant` was checked on this thread since the last
/// [`clear_invariant_log`].
pub fn check_count(invariant: Invariant) -> u32 {
    CHECK_COUNTS.with(|counts| counts.borrow().get(&invariant).copied().unwrap_or(0))
}

/// Fail unless every listed invariant was checked on this thread.
pub fn contract_test(test_name: &str, required: &[Invariant]) {
    let missing: Vec<&str> = required
        .iter()
        .filter(|inv| check_count(**inv) == 0)
        .map(|inv| inv.description())
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: invariants never checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

pub fn clear_invariant_log() {
    CHECK_COUNTS.with(|counts| counts.borrow_mut().clear());
}
