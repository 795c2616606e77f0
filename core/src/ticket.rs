//! Ticket instances as carried in ledger asset bodies.
//!
//! A ticket is written in full ([`Ticket::Embedded`]) the first time it is
//! issued. Every later transfer re-wraps it by id only ([`Ticket::Reference`]);
//! the full form is resolved through the ticket registry.
//!
//! # Wire layout
//!
//! ```text
//! typeTag:u8 = 0 | TicketSpec | time_of_origin:u64
//! typeTag:u8 = 1 | idLen:u16 | ticket_id
//! ```

use crate::codec::{DecodeError, Reader, Writer};
use crate::ids::{ID_LEN, TicketId};
use crate::spec::TicketSpec;

const T_TICKET: u8 = 0;
const T_TICKET_ID: u8 = 1;

/// A ticket in one of its two wire forms.
#[derive(Clone, Debug, PartialEq)]
pub enum Ticket {
    /// Full ticket, used when it is first created.
    Embedded {
        /// Ticket class.
        spec: TicketSpec,
        /// Creation time, epoch seconds.
        time_of_origin: u64,
    },
    /// Id-only reference to an already issued ticket.
    Reference {
        /// The issued ticket's content identifier.
        ticket_id: TicketId,
    },
}

impl Ticket {
    /// Full ticket.
    #[must_use]
    pub const fn embedded(spec: TicketSpec, time_of_origin: u64) -> Self {
        Self::Embedded {
            spec,
            time_of_origin,
        }
    }

    /// Id-only reference.
    #[must_use]
    pub const fn reference(ticket_id: TicketId) -> Self {
        Self::Reference { ticket_id }
    }

    /// The spec, for embedded tickets.
    #[must_use]
    pub const fn spec(&self) -> Option<&TicketSpec> {
        match self {
            Self::Embedded { spec, .. } => Some(spec),
            Self::Reference { .. } => None,
        }
    }

    /// The id, for reference tickets.
    #[must_use]
    pub const fn ticket_id(&self) -> Option<TicketId> {
        match self {
            Self::Embedded { .. } => None,
            Self::Reference { ticket_id } => Some(*ticket_id),
        }
    }

    /// `None` for reference tickets, which carry no spec.
    #[must_use]
    pub fn is_divisible(&self) -> Option<bool> {
        self.spec().map(TicketSpec::is_divisible)
    }

    /// `None` for reference tickets, which carry no spec.
    #[must_use]
    pub fn is_transferable(&self) -> Option<bool> {
        self.spec().map(TicketSpec::is_transferable)
    }

    /// `None` for reference tickets, which carry no spec.
    #[must_use]
    pub fn is_relative_time(&self) -> Option<bool> {
        self.spec().map(TicketSpec::is_relative_time)
    }

    /// Encode into a fresh buffer.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ID_LEN fits in u16
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Embedded {
                spec,
                time_of_origin,
            } => {
                w.put_u8(T_TICKET);
                spec.write_to(&mut w);
                w.put_u64(*time_of_origin);
            }
            Self::Reference { ticket_id } => {
                w.put_u8(T_TICKET_ID);
                w.put_u16(ID_LEN as u16);
                w.put_bytes(ticket_id.as_bytes());
            }
        }
        w.into_bytes()
    }

    /// Decode a ticket starting at `offset`, returning the offset just past it.
    ///
    /// # Errors
    ///
    /// [`DecodeError`] on truncated input, an unknown type tag, an id of the
    /// wrong length, or an invalid embedded spec.
    pub fn deserialize(data: &[u8], offset: usize) -> Result<(usize, Self), DecodeError> {
        let mut r = Reader::at(data, offset);
        let ticket = match r.u8()? {
            T_TICKET => {
                let spec = TicketSpec::read_from(&mut r)?;
                let time_of_origin = r.u64()?;
                Self::Embedded {
                    spec,
                    time_of_origin,
                }
            }
            T_TICKET_ID => {
                let len = usize::from(r.u16()?);
                if len != ID_LEN {
                    return Err(DecodeError::InconsistentLength {
                        what: "ticket id",
                        expected: ID_LEN,
                        actual: len,
                    });
                }
                let bytes = r.take(len)?;
                let ticket_id = TicketId::from_slice(bytes).map_err(|_| DecodeError::InconsistentLength {
                    what: "ticket id",
                    expected: ID_LEN,
                    actual: bytes.len(),
                })?;
                Self::Reference { ticket_id }
            }
            value => {
                return Err(DecodeError::UnknownDiscriminant {
                    what: "ticket type",
                    value,
                });
            }
        };
        Ok((r.position(), ticket))
    }

    /// Decode a whole buffer holding exactly one ticket.
    ///
    /// # Errors
    ///
    /// As [`Ticket::deserialize`], plus [`DecodeError::InconsistentLength`]
    /// when bytes trail the ticket.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let (end, ticket) = Self::deserialize(data, 0)?;
        if end != data.len() {
            return Err(DecodeError::InconsistentLength {
                what: "ticket payload",
                expected: end,
                actual: data.len(),
            });
        }
        Ok(ticket)
    }
}
