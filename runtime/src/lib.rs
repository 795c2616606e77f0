//! # Ticket Ledger Runtime
//!
//! Runtime for ledger-backed ticket ownership.
//!
//! This crate keeps a local, derived index of which ledger outputs are
//! spendable tickets and drives the multi-party protocol that issues,
//! transfers and redeems them.
//!
//! ## Core Components
//!
//! - **[`TicketStore`]**: the ownership index and its FREE / RESERVED / TAKEN
//!   state machine
//! - **[`TransactionBuilder`]**: unsigned issue / transfer / redeem transactions
//! - **[`SigningCoordinator`]**: local and cross-party signing, then submission
//! - **[`TicketService`]**: the facade, plus the notification loop applying
//!   ledger acceptance notices to the index
//!
//! ## Example
//!
//! ```ignore
//! use ticket_ledger_runtime::{TicketService, TicketServiceConfig};
//!
//! let service = TicketService::new(
//!     TicketServiceConfig::for_service(service_id),
//!     ledger_client,
//!     tables,
//!     key_directory,
//!     Arc::new(SystemClock),
//! );
//! service.set_signer(service_key.clone());
//! let _listener = service.start().await?;
//!
//! let (ticket_id, _) = service.issue(alice, spec, None, service_key.as_ref()).await?;
//! assert!(service.is_valid_holder(alice, ticket_id).await?);
//! ```

/// Transaction construction
pub mod builder;

/// Service configuration
pub mod config;

/// Signing and submission
pub mod coordinator;

/// Metrics for observability
pub mod metrics;

/// Service facade and notification loop
pub mod service;

/// Ownership index
pub mod store;

pub use builder::TransactionBuilder;
pub use config::{ConfigError, TicketServiceConfig};
pub use coordinator::SigningCoordinator;
pub use service::TicketService;
pub use store::{Applied, Reservation, TicketStore};
