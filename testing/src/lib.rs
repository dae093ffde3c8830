//! # Taskflow Testing
//!
//! Testing utilities for the Taskflow event-delivery subsystem.
//!
//! This crate provides:
//! - Deterministic in-memory implementations of every store trait in
//!   `taskflow-core` ([`stores`])
//! - An in-memory broker with scripted failure injection ([`broker`])
//! - A fixed clock for reproducible time ([`mocks`])
//!
//! The in-memory stores preserve the concurrency semantics the runtime
//! relies on — unique-key inserts, conditional updates, atomic batch
//! claims — behind a mutex, so delivery-pipeline tests exercise the same
//! code paths as production without a database.
//!
//! ## Example
//!
//! ```
//! use taskflow_testing::{test_clock, stores::InMemoryInboxStore};
//! use taskflow_core::environment::Clock;
//!
//! let clock = test_clock();
//! assert_eq!(clock.now(), clock.now()); // Always the same
//!
//! let _store = InMemoryInboxStore::new();
//! ```

pub mod broker;
pub mod stores;

/// Mock implementations for testing.
pub mod mocks {
    use chrono::{DateTime, Utc};
    use taskflow_core::environment::Clock;

    /// Fixed clock for deterministic tests.
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use taskflow_testing::mocks::FixedClock;
    /// use taskflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now()); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use broker::InMemoryBroker;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_core::environment::Clock;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }
}
