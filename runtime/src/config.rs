//! Service configuration.
//!
//! Built in code with [`TicketServiceConfig::new`] and the `with_*` setters, or
//! read from the process environment with [`TicketServiceConfig::from_env`]:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `TICKET_SERVICE_ID` | ticket service identity (hex) | required |
//! | `TICKET_USER_ID` | identity this participant acts as (hex) | the service id |
//! | `TICKET_INDEPENDENT` | drop pending transactions once applied | `false` |
//! | `TICKET_RESPONSE_TIMEOUT_SECS` | bound on every ledger round trip | `30` |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use ticket_ledger_core::ids::UserId;

/// Default bound on ledger round trips.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(&'static str),

    /// Failed to parse an environment variable
    #[error("Failed to parse {var}: {reason}")]
    ParseError {
        /// Variable name.
        var: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Configuration of one participant's [`TicketService`](crate::service::TicketService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketServiceConfig {
    /// Ticket service identity; also the asset group of every ticket event.
    pub service_id: UserId,
    /// Identity this participant acts as. Equal to `service_id` for the service itself.
    pub user_id: UserId,
    /// Whether the index deletes pending transactions once they are applied.
    pub independent: bool,
    /// Bound on every ledger round trip.
    pub response_timeout: Duration,
}

impl TicketServiceConfig {
    /// Configuration for `user_id` participating in `service_id`'s tickets.
    #[must_use]
    pub const fn new(service_id: UserId, user_id: UserId) -> Self {
        Self {
            service_id,
            user_id,
            independent: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Configuration for the ticket service itself.
    #[must_use]
    pub const fn for_service(service_id: UserId) -> Self {
        Self::new(service_id, service_id)
    }

    /// Set the pending-transaction self-cleanup mode
    #[must_use]
    pub const fn with_independent(mut self, independent: bool) -> Self {
        self.independent = independent;
        self
    }

    /// Set the ledger round-trip bound
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Whether this participant is the ticket service.
    #[must_use]
    pub fn is_service(&self) -> bool {
        self.user_id == self.service_id
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if `TICKET_SERVICE_ID` is missing, or any variable fails
    /// to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_id = |var: &'static str, raw: String| {
            raw.parse::<UserId>().map_err(|e| ConfigError::ParseError {
                var,
                reason: e.to_string(),
            })
        };

        let service_id = lookup("TICKET_SERVICE_ID")
            .ok_or(ConfigError::EnvVarNotSet("TICKET_SERVICE_ID"))
            .and_then(|raw| parse_id("TICKET_SERVICE_ID", raw))?;
        let user_id = match lookup("TICKET_USER_ID") {
            Some(raw) => parse_id("TICKET_USER_ID", raw)?,
            None => service_id,
        };

        let independent = match lookup("TICKET_INDEPENDENT") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::ParseError {
                var: "TICKET_INDEPENDENT",
                reason: format!("expected a boolean, got {raw:?}"),
            })?,
            None => false,
        };

        let response_timeout = match lookup("TICKET_RESPONSE_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::ParseError {
                    var: "TICKET_RESPONSE_TIMEOUT_SECS",
                    reason: e.to_string(),
                })?,
            None => DEFAULT_RESPONSE_TIMEOUT,
        };

        let config = Self {
            service_id,
            user_id,
            independent,
            response_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if the response timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "response_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_from_minimal_environment() {
        let service = UserId::new([0xab; 32]);
        let config =
            TicketServiceConfig::from_lookup(lookup(&[("TICKET_SERVICE_ID", &service.to_string())]))
                .unwrap();
        assert_eq!(config, TicketServiceConfig::for_service(service));
        assert!(config.is_service());
    }

    #[test]
    fn reads_every_variable() {
        let service = UserId::new([1; 32]);
        let user = UserId::new([2; 32]);
        let config = TicketServiceConfig::from_lookup(lookup(&[
            ("TICKET_SERVICE_ID", &service.to_string()),
            ("TICKET_USER_ID", &user.to_string()),
            ("TICKET_INDEPENDENT", "true"),
            ("TICKET_RESPONSE_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.user_id, user);
        assert!(config.independent);
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert!(!config.is_service());
    }

    #[test]
    fn missing_service_id() {
        assert_eq!(
            TicketServiceConfig::from_lookup(lookup(&[])),
            Err(ConfigError::EnvVarNotSet("TICKET_SERVICE_ID"))
        );
    }

    #[test]
    fn rejects_bad_values() {
        let service = UserId::new([1; 32]).to_string();
        let err = TicketServiceConfig::from_lookup(lookup(&[
            ("TICKET_SERVICE_ID", &service),
            ("TICKET_INDEPENDENT", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { var: "TICKET_INDEPENDENT", .. }));

        let err = TicketServiceConfig::from_lookup(lookup(&[
            ("TICKET_SERVICE_ID", &service),
            ("TICKET_RESPONSE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err =
            TicketServiceConfig::from_lookup(lookup(&[("TICKET_SERVICE_ID", "not-hex")])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { var: "TICKET_SERVICE_ID", .. }));
    }
}
