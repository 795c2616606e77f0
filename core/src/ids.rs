//! Fixed-size identifiers for principals, ledger transactions and tickets.
//!
//! All identifiers are 32-byte values (SHA-256 sized), displayed and parsed as
//! lowercase hex. The ticket service identity is an ordinary [`UserId`]; it also
//! serves as the asset group of every ticket event on the ledger.
//!
//! # Examples
//!
//! ```
//! use ticket_ledger_core::ids::TxId;
//!
//! let id = TxId::new([7u8; 32]);
//! let parsed: TxId = id.to_string().parse().unwrap();
//! assert_eq!(parsed, id);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length in bytes of every identifier.
pub const ID_LEN: usize = 32;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// Input was not valid hex.
    #[error("Invalid hex identifier: {0}")]
    InvalidHex(String),

    /// Input decoded to the wrong number of bytes.
    #[error("Identifier must be {ID_LEN} bytes, got {0}")]
    WrongLength(usize),
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Wrap raw identifier bytes.
            #[must_use]
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Build an identifier from a byte slice of exactly [`ID_LEN`] bytes.
            ///
            /// # Errors
            ///
            /// Returns [`ParseIdError::WrongLength`] for any other length.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseIdError> {
                <[u8; ID_LEN]>::try_from(bytes)
                    .map(Self)
                    .map_err(|_| ParseIdError::WrongLength(bytes.len()))
            }

            /// SHA-256 of `data`, as an identifier.
            #[must_use]
            pub fn digest_of(data: &[u8]) -> Self {
                Self(Sha256::digest(data).into())
            }

            /// Random identifier (for fresh principals and tests).
            #[must_use]
            pub fn random() -> Self {
                Self(rand::random())
            }

            /// Borrow the raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short prefix keeps log lines readable
                write!(f, "{}({}…)", stringify!($name), &hex::encode(self.0)[..8])
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| ParseIdError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

identifier!(
    /// Identity of a principal: a ticket holder or the ticket service itself.
    UserId
);

identifier!(
    /// Ledger transaction identifier (digest of the unsigned transaction body).
    TxId
);

identifier!(
    /// Content identifier of an issued ticket.
    ///
    /// Derived by the ledger as the asset id of the event that first embedded
    /// the ticket.
    TicketId
);

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
    fn hex_round_trip() {
        let id = UserId::new([0xab; ID_LEN]);
        let text = id.to_string();
        assert_eq!(text.len(), ID_LEN * 2);
        assert_eq!(text.parse::<UserId>().expect("parse should succeed"), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!("abcd".parse::<TxId>(), Err(ParseIdError::WrongLength(2)));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!("zz".parse::<TicketId>(), Err(ParseIdError::InvalidHex(_))));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(TicketId::digest_of(b"seat 13A"), TicketId::digest_of(b"seat 13A"));
        assert_ne!(TicketId::digest_of(b"seat 13A"), TicketId::digest_of(b"seat 13B"));
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = TxId::new([0x01; ID_LEN]);
        assert_eq!(format!("{id:?}"), "TxId(01010101…)");
    }
}
