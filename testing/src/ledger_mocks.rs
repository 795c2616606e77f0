//! Simulated ledger network for testing.
//!
//! [`InMemoryLedger`] is the shared network; each participant gets its own
//! [`InMemoryLedgerClient`] through [`InMemoryLedger::client`]. Submissions are
//! validated the way a real ledger would: the digest must match, every
//! signature must verify under a registered key, witnesses and the owners of
//! every referenced output must have signed, and a referenced output can be
//! spent once.
//!
//! Accepted transactions are announced to every subscription whose service id
//! appears as an asset group in the transaction. Signature requests are routed
//! to the counter-party's subscriptions and answered through the requester's
//! pending gather.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use ticket_ledger_core::correlation::ResponseRouter;
use ticket_ledger_core::ids::{TxId, UserId};
use ticket_ledger_core::ledger::{
    LedgerClient, LedgerError, LedgerFuture, LedgerNotification, NotificationStream,
};
use ticket_ledger_core::signing::{Ed25519Verifier, KeyDirectory, Verifier};
use ticket_ledger_core::transaction::{SignatureEntry, Transaction};
use tokio::sync::mpsc;

type SignatureReply = Result<(TxId, SignatureEntry), LedgerError>;

#[derive(Debug)]
struct Subscription {
    user_id: UserId,
    service_id: UserId,
    sender: mpsc::UnboundedSender<LedgerNotification>,
}

#[derive(Debug, Default)]
struct Book {
    transactions: HashMap<TxId, Transaction>,
    spent: HashSet<(TxId, u16)>,
}

struct Network {
    book: Mutex<Book>,
    subscriptions: RwLock<Vec<Subscription>>,
    signature_replies: ResponseRouter<UserId, SignatureReply>,
    directory: Arc<dyn KeyDirectory>,
    verifier: Ed25519Verifier,
    reject_next: Mutex<Option<String>>,
    response_delay: RwLock<Option<Duration>>,
}

impl Network {
    /// Validate and record `tx`, returning the service ids to notify.
    fn accept(&self, tx: &Transaction) -> Result<HashSet<UserId>, LedgerError> {
        let rejected = |reason: &str| LedgerError::Rejected {
            reason: reason.to_string(),
        };

        if let Some(reason) = self.reject_next.lock().ok().and_then(|mut r| r.take()) {
            return Err(LedgerError::Rejected { reason });
        }

        let tx_id = tx.compute_id();
        if tx.id != Some(tx_id) {
            return Err(rejected("transaction digest mismatch"));
        }

        let message = tx_id.as_bytes().to_vec();
        for entry in &tx.signatures {
            let registered = self
                .directory
                .public_keys_of(&entry.user_id)
                .contains(&entry.public_key);
            if !registered || !self.verifier.verify(&entry.public_key, &message, &entry.signature) {
                return Err(rejected("invalid signature"));
            }
        }
        if tx.witness.iter().any(|w| tx.signature_of(w).is_none()) {
            return Err(rejected("missing witness signature"));
        }

        let mut book = self
            .book
            .lock()
            .map_err(|_| LedgerError::Transport("ledger lock poisoned".to_string()))?;
        if book.transactions.contains_key(&tx_id) {
            return Err(rejected("duplicate transaction"));
        }

        let mut seen = HashSet::new();
        for reference in &tx.references {
            let key = (reference.transaction_id, reference.event_index);
            let owner = book
                .transactions
                .get(&reference.transaction_id)
                .and_then(|prev| prev.events.get(usize::from(reference.event_index)))
                .map(|event| event.asset.user_id)
                .ok_or_else(|| rejected("unknown reference"))?;
            if book.spent.contains(&key) || !seen.insert(key) {
                return Err(rejected("reference already spent"));
            }
            if tx.signature_of(&owner).is_none() {
                return Err(rejected("missing signature from referenced owner"));
            }
        }

        book.spent.extend(seen);
        book.transactions.insert(tx_id, tx.clone());

        let mut groups: HashSet<UserId> = tx.events.iter().map(|e| e.asset_group_id).collect();
        groups.extend(tx.references.iter().map(|r| r.asset_group_id));
        Ok(groups)
    }

    fn notify_accepted(&self, tx_id: TxId, groups: &HashSet<UserId>) {
        if let Ok(subscriptions) = self.subscriptions.read() {
            for sub in subscriptions.iter().filter(|s| groups.contains(&s.service_id)) {
                let _ = sub
                    .sender
                    .send(LedgerNotification::TransactionAccepted { tx_id });
            }
        }
    }

    /// Deliver a signature request to `counterparty`; returns whether anyone listens.
    fn request_signature(&self, requester: UserId, counterparty: UserId, raw: &[u8]) -> bool {
        let Ok(subscriptions) = self.subscriptions.read() else {
            return false;
        };
        let mut delivered = false;
        for sub in subscriptions.iter().filter(|s| s.user_id == counterparty) {
            delivered |= sub
                .sender
                .send(LedgerNotification::SignatureRequested {
                    requester,
                    transaction: raw.to_vec(),
                })
                .is_ok();
        }
        delivered
    }
}

/// Shared simulated ledger.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ticket_ledger_core::ids::UserId;
/// use ticket_ledger_core::ledger::LedgerClient;
/// use ticket_ledger_core::signing::InMemoryKeyDirectory;
/// use ticket_ledger_testing::InMemoryLedger;
///
/// let ledger = InMemoryLedger::new(Arc::new(InMemoryKeyDirectory::new()));
/// let alice = UserId::new([7; 32]);
/// assert_eq!(ledger.client(alice).user_id(), alice);
/// ```
#[derive(Clone)]
pub struct InMemoryLedger {
    network: Arc<Network>,
}

impl InMemoryLedger {
    /// Create a ledger that checks signatures against `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            network: Arc::new(Network {
                book: Mutex::new(Book::default()),
                subscriptions: RwLock::new(Vec::new()),
                signature_replies: ResponseRouter::new(),
                directory,
                verifier: Ed25519Verifier,
                reject_next: Mutex::new(None),
                response_delay: RwLock::new(None),
            }),
        }
    }

    /// Client acting as `user_id`.
    #[must_use]
    pub fn client(&self, user_id: UserId) -> InMemoryLedgerClient {
        InMemoryLedgerClient {
            user_id,
            network: Arc::clone(&self.network),
        }
    }

    /// A recorded transaction.
    #[must_use]
    pub fn transaction(&self, tx_id: TxId) -> Option<Transaction> {
        self.network
            .book
            .lock()
            .ok()
            .and_then(|book| book.transactions.get(&tx_id).cloned())
    }

    /// Number of recorded transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.network
            .book
            .lock()
            .map(|book| book.transactions.len())
            .unwrap_or(0)
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject the next submission with `reason`, whatever it contains.
    pub fn reject_next(&self, reason: impl Into<String>) {
        if let Ok(mut next) = self.network.reject_next.lock() {
            *next = Some(reason.into());
        }
    }

    /// Hold every submission verdict for `delay` after the transaction has
    /// already been recorded and announced. `None` answers immediately.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.network.response_delay.write() {
            *current = delay;
        }
    }
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("transactions", &self.len())
            .finish_non_exhaustive()
    }
}

/// One participant's view of an [`InMemoryLedger`].
#[derive(Clone)]
pub struct InMemoryLedgerClient {
    user_id: UserId,
    network: Arc<Network>,
}

impl std::fmt::Debug for InMemoryLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedgerClient")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl LedgerClient for InMemoryLedgerClient {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn submit_transaction(&self, tx: &Transaction) -> LedgerFuture<'_, ()> {
        let tx = tx.clone();
        Box::pin(async move {
            let groups = self.network.accept(&tx)?;
            let tx_id = tx.tx_id();
            tracing::debug!(%tx_id, submitter = %self.user_id, "ledger accepted transaction");
            self.network.notify_accepted(tx_id, &groups);

            let delay = self.network.response_delay.read().ok().and_then(|d| *d);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
    }

    fn fetch_transaction(&self, tx_id: TxId) -> LedgerFuture<'_, Option<Transaction>> {
        Box::pin(async move {
            let book = self
                .network
                .book
                .lock()
                .map_err(|_| LedgerError::Transport("ledger lock poisoned".to_string()))?;
            Ok(book.transactions.get(&tx_id).cloned())
        })
    }

    fn gather_remote_signature(
        &self,
        tx: &Transaction,
        counterparty: UserId,
    ) -> LedgerFuture<'_, SignatureEntry> {
        let raw = tx.to_bytes();
        let expected = tx.tx_id();
        Box::pin(async move {
            let reply = self.network.signature_replies.register(self.user_id);
            if !self.network.request_signature(self.user_id, counterparty, &raw) {
                self.network.signature_replies.cancel(&self.user_id);
                return Err(LedgerError::Transport(format!(
                    "counter-party {counterparty} is not connected"
                )));
            }

            let (tx_id, signature) = reply.await.map_err(|_| LedgerError::ChannelClosed)??;
            if tx_id != expected {
                return Err(LedgerError::Transport(format!(
                    "signature answers {tx_id}, expected {expected}"
                )));
            }
            Ok(signature)
        })
    }

    fn subscribe_accepted_transactions(&self, service_id: UserId) -> LedgerFuture<'_, NotificationStream> {
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.network
                .subscriptions
                .write()
                .map_err(|_| LedgerError::Transport("ledger lock poisoned".to_string()))?
                .push(Subscription {
                    user_id: self.user_id,
                    service_id,
                    sender,
                });

            let stream = async_stream::stream! {
                while let Some(notification) = receiver.recv().await {
                    yield notification;
                }
            };
            Ok(stream.boxed())
        })
    }

    fn send_signature_response(
        &self,
        requester: UserId,
        tx_id: TxId,
        signature: SignatureEntry,
    ) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            if !self
                .network
                .signature_replies
                .resolve(&requester, Ok((tx_id, signature)))
            {
                tracing::debug!(%requester, %tx_id, "signature response had no waiter");
            }
            Ok(())
        })
    }

    fn send_signature_denial(&self, requester: UserId, reason: String) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            if !self
                .network
                .signature_replies
                .resolve(&requester, Err(LedgerError::SignatureDenied { reason }))
            {
                tracing::debug!(%requester, "signature denial had no waiter");
            }
            Ok(())
        })
    }
}
