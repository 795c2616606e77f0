//! Transaction construction, independent of signing.

use crate::store::TicketStore;
use std::sync::Arc;
use ticket_ledger_core::environment::Clock;
use ticket_ledger_core::ids::{TicketId, UserId};
use ticket_ledger_core::spec::TicketSpec;
use ticket_ledger_core::ticket::Ticket;
use ticket_ledger_core::transaction::{Asset, Event, Reference, Transaction};
use ticket_ledger_core::{Result, TicketError};

/// Builds unsigned issue, transfer and redeem transactions for one service.
#[derive(Clone)]
pub struct TransactionBuilder {
    store: Arc<TicketStore>,
    clock: Arc<dyn Clock>,
}

impl TransactionBuilder {
    /// Builder resolving holders and tickets through `store`.
    #[must_use]
    pub fn new(store: Arc<TicketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn service_id(&self) -> UserId {
        self.store.service_id()
    }

    fn event(&self, reference_indices: Vec<u16>, to: UserId, ticket: &Ticket) -> Event {
        let service_id = self.service_id();
        Event {
            asset_group_id: service_id,
            reference_indices,
            mandatory_approvers: vec![service_id, to],
            asset: Asset::new(to, ticket.serialize()),
        }
    }

    /// Unsigned issuance of a new ticket to `to`.
    ///
    /// `time_of_origin` defaults to the transaction timestamp. The returned
    /// ticket id is the asset id of the single output, which the ledger keeps
    /// as the ticket's identity once recorded.
    #[must_use]
    pub fn build_issue(
        &self,
        to: UserId,
        spec: TicketSpec,
        time_of_origin: Option<u64>,
    ) -> (TicketId, Transaction) {
        let mut tx = Transaction::new(self.clock.epoch_seconds());
        let origin = time_of_origin.unwrap_or(tx.timestamp);
        let event = self.event(Vec::new(), to, &Ticket::embedded(spec, origin));
        let ticket_id = event.asset.asset_id;
        tx.events.push(event);
        tx.witness.push(self.service_id());
        (ticket_id, tx)
    }

    /// Unsigned transfer of `ticket_id` from `from` to `to`.
    ///
    /// Spends `from`'s usable event and appends one reference and one
    /// reference-form output to `existing`, or to a fresh transaction.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] if the ticket is not registered or `from`
    ///   holds no usable event for it
    /// - [`TicketError::Policy`] if the ticket is not transferable
    #[tracing::instrument(skip(self, existing), fields(service_id = %self.service_id()))]
    pub async fn build_transfer(
        &self,
        from: UserId,
        to: UserId,
        ticket_id: TicketId,
        existing: Option<Transaction>,
    ) -> Result<Transaction> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| TicketError::NotFound(format!("ticket {ticket_id}")))?;
        if !ticket.is_transferable().unwrap_or(false) {
            return Err(TicketError::Policy(format!(
                "ticket {ticket_id} is not transferable"
            )));
        }

        let (ref_tx, event_index) = self
            .store
            .usable_event(from, ticket_id)
            .await?
            .ok_or_else(|| {
                TicketError::NotFound(format!("no usable event of ticket {ticket_id} for {from}"))
            })?;

        let mut tx = existing.unwrap_or_else(|| Transaction::new(self.clock.epoch_seconds()));
        tx.id = None;
        let base_refs = u16::try_from(tx.references.len())
            .map_err(|_| TicketError::Policy("too many references in one transaction".to_string()))?;

        tx.references.push(Reference {
            asset_group_id: self.service_id(),
            transaction_id: ref_tx.tx_id(),
            event_index,
        });
        let event = self.event(vec![base_refs], to, &Ticket::reference(ticket_id));
        tx.events.push(event);
        Ok(tx)
    }

    /// Unsigned return of `ticket_id` from `from` to the service.
    ///
    /// # Errors
    ///
    /// As [`build_transfer`](Self::build_transfer).
    pub async fn build_redeem(
        &self,
        from: UserId,
        ticket_id: TicketId,
        existing: Option<Transaction>,
    ) -> Result<Transaction> {
        self.build_transfer(from, self.service_id(), ticket_id, existing)
            .await
    }
}

impl std::fmt::Debug for TransactionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("service_id", &self.service_id())
            .finish_non_exhaustive()
    }
}
