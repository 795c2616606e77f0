//! Ticket service facade.
//!
//! [`TicketService`] composes the ownership index, the transaction builder and
//! the signing coordinator into the public issue / transfer / redeem / query
//! operations of one participant, and reacts to ledger notifications.
//!
//! A ticket instance moves through
//!
//! ```text
//! Unissued ──issue──▶ Held(A) ──transfer──▶ Held(B) ── … ──redeem──▶ Redeemed(service)
//! ```
//!
//! Inbound ledger traffic is a closed set of [`LedgerNotification`] variants,
//! dispatched by [`TicketService::handle_notification`]. [`TicketService::start`]
//! runs one sequential notification loop per facade, so notices for this
//! service are applied in arrival order and never concurrently. Each applied
//! transaction id is published on a broadcast channel
//! ([`TicketService::subscribe_applied`]); operations that submit subscribe
//! before submitting and return once their own index has caught up.

use crate::builder::TransactionBuilder;
use crate::config::TicketServiceConfig;
use crate::coordinator::SigningCoordinator;
use crate::metrics::TicketMetrics;
use crate::store::TicketStore;
use futures::StreamExt;
use std::sync::{Arc, RwLock};
use ticket_ledger_core::environment::Clock;
use ticket_ledger_core::ids::{TicketId, TxId, UserId};
use ticket_ledger_core::ledger::{LedgerClient, LedgerNotification};
use ticket_ledger_core::signing::{Ed25519Verifier, KeyDirectory, Signer, Verifier};
use ticket_ledger_core::spec::TicketSpec;
use ticket_ledger_core::table::TableStore;
use ticket_ledger_core::transaction::Transaction;
use ticket_ledger_core::{Result, TicketError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the applied-transaction broadcast channel.
const APPLIED_CHANNEL_CAPACITY: usize = 256;

/// One participant's entry point to a ticket service.
///
/// Cheap to clone; clones share the index and the notification channel.
#[derive(Clone)]
pub struct TicketService {
    config: TicketServiceConfig,
    store: Arc<TicketStore>,
    builder: TransactionBuilder,
    coordinator: Arc<SigningCoordinator>,
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<RwLock<Option<Arc<dyn Signer>>>>,
    applied: broadcast::Sender<TxId>,
}

impl TicketService {
    /// Facade for `config.user_id` over its own `tables`, verifying signatures
    /// with Ed25519 against `directory`.
    #[must_use]
    pub fn new(
        config: TicketServiceConfig,
        ledger: Arc<dyn LedgerClient>,
        tables: Arc<dyn TableStore>,
        directory: Arc<dyn KeyDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_verifier(config, ledger, tables, directory, Arc::new(Ed25519Verifier), clock)
    }

    /// Like [`new`](Self::new) with a custom signature scheme.
    #[must_use]
    pub fn with_verifier(
        config: TicketServiceConfig,
        ledger: Arc<dyn LedgerClient>,
        tables: Arc<dyn TableStore>,
        directory: Arc<dyn KeyDirectory>,
        verifier: Arc<dyn Verifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if ledger.user_id() != config.user_id {
            tracing::warn!(
                configured = %config.user_id,
                client = %ledger.user_id(),
                "ledger client identity differs from configured user"
            );
        }
        let store = Arc::new(TicketStore::new(
            config.service_id,
            tables,
            Arc::clone(&ledger),
            Arc::clone(&clock),
            config.independent,
        ));
        let coordinator = Arc::new(SigningCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            directory,
            verifier,
            config.response_timeout,
        ));
        let (applied, _) = broadcast::channel(APPLIED_CHANNEL_CAPACITY);
        Self {
            builder: TransactionBuilder::new(Arc::clone(&store), clock),
            config,
            store,
            coordinator,
            ledger,
            signer: Arc::new(RwLock::new(None)),
            applied,
        }
    }

    /// Configuration this facade runs with.
    #[must_use]
    pub const fn config(&self) -> &TicketServiceConfig {
        &self.config
    }

    /// The ownership index.
    #[must_use]
    pub const fn store(&self) -> &Arc<TicketStore> {
        &self.store
    }

    /// The transaction builder, for unsigned or batched construction.
    #[must_use]
    pub const fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    /// Install the key used to answer counter-signature requests.
    pub fn set_signer(&self, signer: Arc<dyn Signer>) {
        if let Ok(mut slot) = self.signer.write() {
            *slot = Some(signer);
        }
    }

    fn signer(&self) -> Option<Arc<dyn Signer>> {
        self.signer.read().ok().and_then(|slot| slot.clone())
    }

    /// Receive the id of every transaction this facade applies from now on.
    #[must_use]
    pub fn subscribe_applied(&self) -> broadcast::Receiver<TxId> {
        self.applied.subscribe()
    }

    /// Subscribe to the ledger and spawn the notification loop.
    ///
    /// The loop ends when the ledger closes the stream.
    ///
    /// # Errors
    ///
    /// Ledger transport failures while subscribing.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let mut notifications = self
            .ledger
            .subscribe_accepted_transactions(self.config.service_id)
            .await?;
        let service = self.clone();
        tracing::info!(
            service_id = %self.config.service_id,
            user_id = %self.config.user_id,
            "ticket service listening"
        );
        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if let Err(e) = service.handle_notification(notification).await {
                    tracing::error!(error = %e, "failed to handle ledger notification");
                }
            }
            tracing::info!(service_id = %service.config.service_id, "notification stream closed");
        }))
    }

    /// Dispatch one inbound ledger message.
    ///
    /// # Errors
    ///
    /// Table and ledger failures from the handler.
    pub async fn handle_notification(&self, notification: LedgerNotification) -> Result<()> {
        match notification {
            LedgerNotification::SignatureRequested {
                requester,
                transaction,
            } => {
                let signer = self.signer();
                self.coordinator
                    .handle_signature_request(
                        requester,
                        &transaction,
                        self.config.user_id,
                        signer.as_deref(),
                    )
                    .await?;
            }
            LedgerNotification::TransactionAccepted { tx_id } => {
                if self.store.inserted(tx_id).await?.is_some() {
                    TicketMetrics::record_notification_applied();
                    // No receivers is fine
                    let _ = self.applied.send(tx_id);
                }
            }
        }
        Ok(())
    }

    /// Wait until `tx_id` shows up on `applied`, bounded by the response timeout.
    async fn await_applied(&self, mut applied: broadcast::Receiver<TxId>, tx_id: TxId) {
        let wait = async {
            loop {
                match applied.recv().await {
                    Ok(id) if id == tx_id => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "applied channel lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        match tokio::time::timeout(self.config.response_timeout, wait).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::warn!(%tx_id, "accepted transaction not yet applied to the index");
            }
        }
    }

    /// Current holdings value of `user_id`, summed across units.
    ///
    /// # Errors
    ///
    /// Table failures, or a held ticket missing from the registry.
    pub async fn get_balance_of(&self, user_id: UserId) -> Result<i64> {
        self.store.get_balance_of(user_id).await
    }

    /// Whether `user_id` currently holds `ticket_id`.
    ///
    /// # Errors
    ///
    /// Table failures.
    pub async fn is_valid_holder(&self, user_id: UserId, ticket_id: TicketId) -> Result<bool> {
        self.store.is_valid_holder(user_id, ticket_id).await
    }

    /// Issue a new ticket to `to`, signed with the service key.
    ///
    /// Returns the ticket id and the accepted transaction.
    ///
    /// # Errors
    ///
    /// - [`TicketError::Policy`] if this participant is not the service
    /// - submission errors from the coordinator
    #[tracing::instrument(skip(self, spec, service_signer), fields(service_id = %self.config.service_id))]
    pub async fn issue(
        &self,
        to: UserId,
        spec: TicketSpec,
        time_of_origin: Option<u64>,
        service_signer: &dyn Signer,
    ) -> Result<(TicketId, Transaction)> {
        if !self.config.is_service() {
            return Err(TicketError::Policy(
                "issuer must be the ticket service".to_string(),
            ));
        }
        let (ticket_id, mut tx) = self.builder.build_issue(to, spec, time_of_origin);

        let applied = self.subscribe_applied();
        let tx_id = self
            .coordinator
            .sign_and_submit(&mut tx, self.config.service_id, service_signer)
            .await?;
        self.await_applied(applied, tx_id).await;

        TicketMetrics::record_issued();
        tracing::info!(%ticket_id, %tx_id, "ticket issued");
        Ok((ticket_id, tx))
    }

    /// Transfer `ticket_id` from `from` to `to`.
    ///
    /// With `service_signer` the service counter-signs locally; without it the
    /// service's signature is gathered remotely.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] if the ticket is unknown or `from` does not hold it
    /// - [`TicketError::Policy`] if the ticket is not transferable
    /// - signing and submission errors from the coordinator
    #[tracing::instrument(skip(self, holder_signer, service_signer), fields(service_id = %self.config.service_id))]
    pub async fn transfer(
        &self,
        from: UserId,
        to: UserId,
        ticket_id: TicketId,
        holder_signer: &dyn Signer,
        service_signer: Option<&dyn Signer>,
    ) -> Result<Transaction> {
        let tx = self.builder.build_transfer(from, to, ticket_id, None).await?;
        let tx = self.sign_transfer(tx, from, holder_signer, service_signer).await?;
        TicketMetrics::record_transferred();
        tracing::info!(%ticket_id, %from, %to, tx_id = %tx.tx_id(), "ticket transferred");
        Ok(tx)
    }

    /// Return `ticket_id` from `from` to the service.
    ///
    /// # Errors
    ///
    /// As [`transfer`](Self::transfer).
    pub async fn redeem(
        &self,
        from: UserId,
        ticket_id: TicketId,
        holder_signer: &dyn Signer,
        service_signer: Option<&dyn Signer>,
    ) -> Result<Transaction> {
        self.transfer(
            from,
            self.config.service_id,
            ticket_id,
            holder_signer,
            service_signer,
        )
        .await
    }

    /// Sign a transfer built elsewhere (for example a batch from
    /// [`builder`](Self::builder)) as `from` and submit it.
    ///
    /// # Errors
    ///
    /// Signing and submission errors from the coordinator.
    pub async fn sign_transfer(
        &self,
        mut tx: Transaction,
        from: UserId,
        holder_signer: &dyn Signer,
        service_signer: Option<&dyn Signer>,
    ) -> Result<Transaction> {
        let service_id = self.config.service_id;
        let applied = self.subscribe_applied();
        let tx_id = match service_signer {
            Some(service_signer) => {
                self.store.sign(&mut tx, from, holder_signer);
                self.store.sign(&mut tx, service_id, service_signer);
                tx.digest();
                self.coordinator
                    .submit_signed(&mut tx, &[service_id, from])
                    .await?
            }
            None => {
                self.coordinator
                    .submit_with_counter_signature(&mut tx, from, holder_signer, service_id)
                    .await?
            }
        };
        self.await_applied(applied, tx_id).await;
        Ok(tx)
    }

    /// Sign `tx` as `user_id` and submit it, waiting for the index to apply it.
    ///
    /// # Errors
    ///
    /// Signing and submission errors from the coordinator.
    pub async fn sign_and_submit(
        &self,
        mut tx: Transaction,
        user_id: UserId,
        signer: &dyn Signer,
    ) -> Result<Transaction> {
        let applied = self.subscribe_applied();
        let tx_id = self.coordinator.sign_and_submit(&mut tx, user_id, signer).await?;
        self.await_applied(applied, tx_id).await;
        Ok(tx)
    }
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
