//! # Ticket Ledger Testing
//!
//! Testing utilities for the ticket ownership layer.
//!
//! This crate provides:
//! - [`InMemoryLedger`]: simulated ledger network with per-participant clients
//! - [`InMemoryTableStore`]: `HashMap`-backed ticket tables
//! - [`FixedClock`]: deterministic time
//! - [`helpers::Participant`]: an identity with a registered Ed25519 key
//!
//! ## Example
//!
//! ```ignore
//! use ticket_ledger_testing::{helpers, test_clock, InMemoryLedger, InMemoryTableStore};
//!
//! #[tokio::test]
//! async fn issue_a_ticket() {
//!     let directory = Arc::new(InMemoryKeyDirectory::new());
//!     let service = helpers::Participant::register(&directory);
//!     let ledger = InMemoryLedger::new(directory.clone());
//!     let tables = InMemoryTableStore::new();
//!     // build a TicketService over ledger.client(service.user_id) and tables
//! }
//! ```

use chrono::{DateTime, Utc};
use ticket_ledger_core::environment::Clock;

pub mod ledger_mocks;
pub mod table_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`advance`](Self::advance) moves it.
    ///
    /// # Example
    ///
    /// ```
    /// use ticket_ledger_testing::mocks::FixedClock;
    /// use ticket_ledger_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug)]
    pub struct FixedClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut time) = self.time.lock() {
                *time += by;
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time.lock().map(|t| *t).unwrap_or_default()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
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

/// Test helpers and utilities
pub mod helpers {
    use std::sync::Arc;
    use ticket_ledger_core::ids::UserId;
    use ticket_ledger_core::signing::{Ed25519Signer, InMemoryKeyDirectory, Signer};

    /// A participant identity whose key is registered in a directory.
    #[derive(Clone, Debug)]
    pub struct Participant {
        /// Identity.
        pub user_id: UserId,
        /// Signing key registered for [`user_id`](Self::user_id).
        pub signer: Arc<Ed25519Signer>,
    }

    impl Participant {
        /// Create a random identity and register its fresh key in `directory`.
        #[must_use]
        pub fn register(directory: &InMemoryKeyDirectory) -> Self {
            let signer = Ed25519Signer::generate();
            let user_id = UserId::digest_of(&signer.public_key());
            directory.register(user_id, signer.public_key());
            Self {
                user_id,
                signer: Arc::new(signer),
            }
        }

        /// Identity without any registered key.
        #[must_use]
        pub fn unregistered() -> Self {
            Self {
                user_id: UserId::random(),
                signer: Arc::new(Ed25519Signer::generate()),
            }
        }
    }

    /// Install a `tracing` subscriber for test output, once per process.
    ///
    /// Honors `RUST_LOG`; silent otherwise.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use ledger_mocks::{InMemoryLedger, InMemoryLedgerClient};
pub use mocks::{FixedClock, test_clock};
pub use table_mocks::InMemoryTableStore;
