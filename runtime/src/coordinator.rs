//! Multi-party signing and submission.
//!
//! Two topologies reach the ledger:
//!
//! - **Self-authoritative**: every required key is local. Sign, finalize the
//!   digest, reserve the spent outputs, cache the transaction as pending and
//!   submit.
//! - **Cross-party**: a holder signs locally while the service counter-signs
//!   remotely. The spent outputs are reserved *before* the transaction is
//!   handed to the service, then the gathered signature is attached and the
//!   transaction proceeds as above.
//!
//! [`SigningCoordinator::handle_signature_request`] is the service side of the
//! cross-party exchange. It never submits; whoever finalizes the transaction
//! does.
//!
//! Every ledger round trip is bounded by the configured response timeout and a
//! timeout surfaces as [`TicketError::Timeout`]. A submission that times out
//! keeps its reservations, since the ledger may still accept it later. Any
//! failure before submission (a denied, lost or late counter-signature, a
//! failed verification) releases them, as does an explicit rejection.

use crate::metrics::TicketMetrics;
use crate::store::TicketStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ticket_ledger_core::ids::{TxId, UserId};
use ticket_ledger_core::ledger::{LedgerClient, LedgerError};
use ticket_ledger_core::signing::{KeyDirectory, Signer, Verifier, verify_signers};
use ticket_ledger_core::transaction::{SignatureEntry, Transaction};
use ticket_ledger_core::{Result, TicketError};

/// Drives signature collection and ledger submission for one participant.
pub struct SigningCoordinator {
    store: Arc<TicketStore>,
    ledger: Arc<dyn LedgerClient>,
    directory: Arc<dyn KeyDirectory>,
    verifier: Arc<dyn Verifier>,
    response_timeout: Duration,
}

impl SigningCoordinator {
    /// Coordinator reserving through `store` and submitting through `ledger`.
    #[must_use]
    pub fn new(
        store: Arc<TicketStore>,
        ledger: Arc<dyn LedgerClient>,
        directory: Arc<dyn KeyDirectory>,
        verifier: Arc<dyn Verifier>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            directory,
            verifier,
            response_timeout,
        }
    }

    /// Bound applied to every ledger round trip.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = std::result::Result<T, LedgerError>>,
    ) -> Result<std::result::Result<T, LedgerError>> {
        tokio::time::timeout(self.response_timeout, call)
            .await
            .map_err(|_| {
                tracing::warn!(operation, after = ?self.response_timeout, "ledger did not answer in time");
                TicketError::Timeout {
                    operation,
                    after: self.response_timeout,
                }
            })
    }

    /// Sign `tx` as `user_id`, finalize it and submit it.
    ///
    /// The service and `user_id` must both have signed once this signature is
    /// attached.
    ///
    /// # Errors
    ///
    /// See [`submit_signed`](Self::submit_signed).
    pub async fn sign_and_submit(
        &self,
        tx: &mut Transaction,
        user_id: UserId,
        signer: &dyn Signer,
    ) -> Result<TxId> {
        self.store.sign(tx, user_id, signer);
        tx.digest();
        self.submit_signed(tx, &[self.store.service_id(), user_id])
            .await
    }

    /// Submit an already signed `tx`, verifying `required` signers first.
    ///
    /// Reserves the outputs `tx` spends, caches it as pending, then waits for
    /// the ledger's verdict.
    ///
    /// # Errors
    ///
    /// - [`TicketError::Policy`] if a required signature is missing or invalid,
    ///   or a spent output is already reserved or taken
    /// - [`TicketError::Submission`] if the ledger rejects the transaction
    /// - [`TicketError::Timeout`] if the ledger does not answer in time
    pub async fn submit_signed(&self, tx: &mut Transaction, required: &[UserId]) -> Result<TxId> {
        self.verify(tx, required)?;
        let reserved = self.store.reserve_referred_utxos(tx).await?;
        self.submit_reserved(tx, reserved).await
    }

    fn verify(&self, tx: &Transaction, required: &[UserId]) -> Result<()> {
        let mut required = required.to_vec();
        required.dedup();
        verify_signers(tx, self.directory.as_ref(), self.verifier.as_ref(), &required).map_err(
            |user| TicketError::Policy(format!("signature of {user} could not be verified")),
        )
    }

    #[tracing::instrument(skip_all, fields(tx_id = %tx.tx_id()))]
    async fn submit_reserved(&self, tx: &mut Transaction, reserved: Vec<(TxId, u16)>) -> Result<TxId> {
        let tx_id = tx.digest();
        if let Err(e) = self.store.push_tx(tx).await {
            self.store.release_all(&reserved).await;
            return Err(e);
        }

        let started = Instant::now();
        let verdict = self
            .bounded("ledger submission", self.ledger.submit_transaction(tx))
            .await?;
        match verdict {
            Ok(()) => {
                TicketMetrics::record_submission(started.elapsed(), false);
                tracing::info!(%tx_id, "transaction accepted by ledger");
                Ok(tx_id)
            }
            Err(LedgerError::Rejected { reason }) => {
                TicketMetrics::record_submission(started.elapsed(), true);
                tracing::warn!(%tx_id, %reason, "transaction rejected by ledger");
                self.store.release_all(&reserved).await;
                Err(TicketError::Submission(reason))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sign `tx` as `user_id` with `counterparty`'s signature gathered
    /// remotely, then submit.
    ///
    /// # Errors
    ///
    /// - [`TicketError::SigningDenied`] if the counter-party refuses
    /// - [`TicketError::Timeout`] if no signature arrives in time
    /// - [`TicketError::Ledger`] if the request cannot reach the counter-party
    ///
    /// Every failure before submission releases the reserved outputs.
    /// - everything [`submit_signed`](Self::submit_signed) returns
    #[tracing::instrument(skip(self, tx, signer), fields(tx_id = %tx.tx_id()))]
    pub async fn submit_with_counter_signature(
        &self,
        tx: &mut Transaction,
        user_id: UserId,
        signer: &dyn Signer,
        counterparty: UserId,
    ) -> Result<TxId> {
        let reserved = self.store.reserve_referred_utxos(tx).await?;

        let gathered = self
            .bounded(
                "remote signature",
                self.ledger.gather_remote_signature(tx, counterparty),
            )
            .await
            .and_then(|answer| answer.map_err(TicketError::from));
        let signature = match gathered {
            Ok(signature) => signature,
            Err(e) => {
                // Without the counter-signature nobody can submit this transaction
                tracing::warn!(%counterparty, error = %e, "counter-signature not obtained");
                self.store.release_all(&reserved).await;
                return Err(e);
            }
        };

        tx.add_signature(signature);
        self.store.sign(tx, user_id, signer);
        tx.digest();
        if let Err(e) = self.verify(tx, &[counterparty, user_id]) {
            self.store.release_all(&reserved).await;
            return Err(e);
        }
        self.submit_reserved(tx, reserved).await
    }

    /// Answer a counter-signature request from `requester`.
    ///
    /// Denies when no key is configured, the payload is not a transaction, or
    /// an output it spends is already reserved or taken. Otherwise signs as
    /// `user_id`, reserves the spent outputs, caches the transaction as pending
    /// and returns the signature. Returns whether the request was signed.
    ///
    /// A failure while caching or answering releases the reservation and
    /// denies the request.
    ///
    /// # Errors
    ///
    /// Ledger transport failures while sending the denial.
    #[tracing::instrument(skip(self, raw, signer))]
    pub async fn handle_signature_request(
        &self,
        requester: UserId,
        raw: &[u8],
        user_id: UserId,
        signer: Option<&dyn Signer>,
    ) -> Result<bool> {
        let Some(signer) = signer else {
            return self.deny(requester, "signing key is not configured").await;
        };
        let mut tx = match Transaction::from_bytes(raw) {
            Ok(tx) => tx,
            Err(e) => return self.deny(requester, &e.to_string()).await,
        };

        let signature = self.store.sign(&mut tx, user_id, signer);
        let tx_id = tx.digest();

        let reserved = match self.store.reserve_referred_utxos(&tx).await {
            Ok(reserved) => reserved,
            Err(e) => return self.deny(requester, &e.to_string()).await,
        };
        if let Err(e) = self.answer(requester, &tx, tx_id, signature).await {
            self.store.release_all(&reserved).await;
            return self.deny(requester, &e.to_string()).await;
        }
        TicketMetrics::record_signature_request(true);
        tracing::info!(%tx_id, "counter-signed transaction");
        Ok(true)
    }

    async fn answer(
        &self,
        requester: UserId,
        tx: &Transaction,
        tx_id: TxId,
        signature: SignatureEntry,
    ) -> Result<()> {
        self.store.push_tx(tx).await?;
        self.ledger
            .send_signature_response(requester, tx_id, signature)
            .await?;
        Ok(())
    }

    async fn deny(&self, requester: UserId, reason: &str) -> Result<bool> {
        tracing::warn!(%requester, reason, "denying signature request");
        TicketMetrics::record_signature_request(false);
        self.ledger
            .send_signature_denial(requester, reason.to_string())
            .await?;
        Ok(false)
    }
}

impl std::fmt::Debug for SigningCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCoordinator")
            .field("service_id", &self.store.service_id())
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}
