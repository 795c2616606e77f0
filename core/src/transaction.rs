//! Ledger transaction model.
//!
//! The ledger records transactions made of output [`Event`]s (each carrying
//! one [`Asset`] owned by a user) and input [`Reference`]s to outputs of
//! earlier transactions. A transaction's id is the digest of everything except
//! its signatures, so parties can sign in any order and a counter-signature
//! gathered remotely attaches to the same id.
//!
//! Raw transactions (ledger payloads, pending cache rows) are the `bincode`
//! encoding of [`Transaction`].

use crate::codec::DecodeError;
use crate::ids::{TicketId, TxId, UserId};
use crate::signing::Signer;
use serde::{Deserialize, Serialize};

/// Current transaction format version.
pub const TX_VERSION: u32 = 1;

/// Payload owned by one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Content identifier: SHA-256 of owner, nonce and body.
    pub asset_id: TicketId,
    /// Owner of this output.
    pub user_id: UserId,
    /// Random salt so identical bodies get distinct ids.
    pub nonce: [u8; 32],
    /// Application payload (a serialized ticket).
    pub body: Vec<u8>,
}

impl Asset {
    /// Create an asset with a fresh nonce and derived id.
    #[must_use]
    pub fn new(user_id: UserId, body: Vec<u8>) -> Self {
        let nonce: [u8; 32] = rand::random();
        let asset_id = Self::derive_id(&user_id, &nonce, &body);
        Self {
            asset_id,
            user_id,
            nonce,
            body,
        }
    }

    fn derive_id(user_id: &UserId, nonce: &[u8; 32], body: &[u8]) -> TicketId {
        let mut material = Vec::with_capacity(64 + body.len());
        material.extend_from_slice(user_id.as_bytes());
        material.extend_from_slice(nonce);
        material.extend_from_slice(body);
        TicketId::digest_of(&material)
    }
}

/// One output of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Asset group (the ticket service identity).
    pub asset_group_id: UserId,
    /// Indices into [`Transaction::references`] this output consumes.
    pub reference_indices: Vec<u16>,
    /// Users that must approve this output.
    pub mandatory_approvers: Vec<UserId>,
    /// The owned payload.
    pub asset: Asset,
}

/// Input pointing at an output of an earlier transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Asset group of the referenced output.
    pub asset_group_id: UserId,
    /// Transaction holding the referenced output.
    pub transaction_id: TxId,
    /// Index of the output within that transaction.
    pub event_index: u16,
}

/// A user's signature over a transaction id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Signing user.
    pub user_id: UserId,
    /// Public key the signature verifies under.
    pub public_key: Vec<u8>,
    /// Signature bytes.
    pub signature: Vec<u8>,
}

/// A ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Format version.
    pub version: u32,
    /// Creation time, epoch seconds.
    pub timestamp: u64,
    /// Outputs.
    pub events: Vec<Event>,
    /// Inputs.
    pub references: Vec<Reference>,
    /// Users whose signature is required without an input of theirs.
    pub witness: Vec<UserId>,
    /// Collected signatures, one per user.
    pub signatures: Vec<SignatureEntry>,
    /// Finalized id; `None` until [`digest`](Self::digest) is called.
    pub id: Option<TxId>,
}

#[derive(Serialize)]
struct SigningBody<'a> {
    version: u32,
    timestamp: u64,
    events: &'a [Event],
    references: &'a [Reference],
    witness: &'a [UserId],
}

impl Transaction {
    /// Empty transaction stamped with `timestamp`.
    #[must_use]
    pub const fn new(timestamp: u64) -> Self {
        Self {
            version: TX_VERSION,
            timestamp,
            events: Vec::new(),
            references: Vec::new(),
            witness: Vec::new(),
            signatures: Vec::new(),
            id: None,
        }
    }

    /// Id computed from the current contents (signatures excluded).
    ///
    /// # Panics
    ///
    /// Never: the bincode encoding of these fields into memory has no error path.
    #[must_use]
    pub fn compute_id(&self) -> TxId {
        let body = SigningBody {
            version: self.version,
            timestamp: self.timestamp,
            events: &self.events,
            references: &self.references,
            witness: &self.witness,
        };
        TxId::digest_of(&encode(&body))
    }

    /// Finalize and return the transaction id.
    pub fn digest(&mut self) -> TxId {
        let id = self.compute_id();
        self.id = Some(id);
        id
    }

    /// Finalized id, or the id the current contents would finalize to.
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        self.id.unwrap_or_else(|| self.compute_id())
    }

    /// Sign the current contents as `user_id` and attach the signature.
    pub fn sign(&mut self, user_id: UserId, signer: &dyn Signer) -> SignatureEntry {
        let message = self.compute_id();
        let entry = SignatureEntry {
            user_id,
            public_key: signer.public_key(),
            signature: signer.sign(message.as_bytes()),
        };
        self.add_signature(entry.clone());
        entry
    }

    /// Attach a signature, replacing any earlier one by the same user.
    pub fn add_signature(&mut self, entry: SignatureEntry) {
        if let Some(existing) = self
            .signatures
            .iter_mut()
            .find(|s| s.user_id == entry.user_id)
        {
            *existing = entry;
        } else {
            self.signatures.push(entry);
        }
    }

    /// Signature by `user_id`, if any.
    #[must_use]
    pub fn signature_of(&self, user_id: &UserId) -> Option<&SignatureEntry> {
        self.signatures.iter().find(|s| &s.user_id == user_id)
    }

    /// References whose asset group is `service_id`.
    pub fn references_in<'a>(&'a self, service_id: &'a UserId) -> impl Iterator<Item = &'a Reference> + 'a {
        self.references
            .iter()
            .filter(move |r| &r.asset_group_id == service_id)
    }

    /// Raw encoding.
    ///
    /// # Panics
    ///
    /// Never: the bincode encoding of these fields into memory has no error path.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode a raw transaction.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Transaction`] when the payload is not a transaction.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        bincode::deserialize(data).map_err(|e| DecodeError::Transaction(e.to_string()))
    }
}

/// Bincode encoding of a transaction or its signing body.
///
/// Every field is a fixed-size array, an integer, an `Option` or a `Vec` of
/// those, all with known lengths, and the target is an unbounded in-memory
/// buffer. Under bincode's default options that has no error path.
#[allow(clippy::expect_used)]
fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("in-memory bincode encoding of sized fields")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signing::Ed25519Signer;

    fn sample() -> Transaction {
        let service = UserId::new([1; 32]);
        let holder = UserId::new([2; 32]);
        let mut tx = Transaction::new(1_552_600_000);
        tx.events.push(Event {
            asset_group_id: service,
            reference_indices: vec![],
            mandatory_approvers: vec![service, holder],
            asset: Asset::new(holder, vec![1, 2, 3]),
        });
        tx.witness.push(service);
        tx
    }

    #[test]
    fn id_ignores_signatures() {
        let mut tx = sample();
        let before = tx.compute_id();
        tx.sign(UserId::new([1; 32]), &Ed25519Signer::generate());
        assert_eq!(tx.compute_id(), before);
        assert_eq!(tx.digest(), before);
        assert_eq!(tx.id, Some(before));
    }

    #[test]
    fn id_covers_contents() {
        let mut tx = sample();
        let before = tx.compute_id();
        tx.timestamp += 1;
        assert_ne!(tx.compute_id(), before);
    }

    #[test]
    fn add_signature_replaces_same_user() {
        let mut tx = sample();
        let user = UserId::new([1; 32]);
        tx.sign(user, &Ed25519Signer::generate());
        let second = tx.sign(user, &Ed25519Signer::generate());
        assert_eq!(tx.signatures.len(), 1);
        assert_eq!(tx.signature_of(&user), Some(&second));
    }

    #[test]
    fn assets_get_distinct_ids() {
        let holder = UserId::new([2; 32]);
        assert_ne!(
            Asset::new(holder, vec![1]).asset_id,
            Asset::new(holder, vec![1]).asset_id
        );
    }

    #[test]
    fn bytes_round_trip() {
        let mut tx = sample();
        tx.digest();
        assert_eq!(Transaction::from_bytes(&tx.to_bytes()).unwrap(), tx);
        assert!(matches!(
            Transaction::from_bytes(&[0xff]),
            Err(DecodeError::Transaction(_))
        ));
    }

    #[test]
    fn encoding_is_never_empty() {
        let mut tx = sample();
        tx.sign(UserId::new([2; 32]), &Ed25519Signer::generate());
        let bytes = tx.to_bytes();
        assert_eq!(u64::try_from(bytes.len()).unwrap(), bincode::serialized_size(&tx).unwrap());
        assert_ne!(tx.compute_id(), TxId::digest_of(&[]));
        assert_ne!(Transaction::new(0).compute_id(), TxId::digest_of(&[]));
    }
}
