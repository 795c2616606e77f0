//! End-to-end ticket lifecycle across several participants sharing one ledger.
//!
//! Each participant runs its own [`TicketService`] facade over its own table
//! store, listening on the in-memory ledger.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;
use ticket_ledger_core::ids::{TicketId, TxId};
use ticket_ledger_core::ledger::{LedgerClient, LedgerError, LedgerNotification};
use ticket_ledger_core::signing::InMemoryKeyDirectory;
use ticket_ledger_core::spec::{Description, TicketSpec, TicketSpecParams};
use ticket_ledger_core::table::UtxoState;
use ticket_ledger_core::TicketError;
use ticket_ledger_runtime::{TicketService, TicketServiceConfig};
use ticket_ledger_testing::helpers::{Participant, init_tracing};
use ticket_ledger_testing::{InMemoryLedger, InMemoryTableStore, test_clock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Node {
    who: Participant,
    facade: TicketService,
    tables: InMemoryTableStore,
    listener: JoinHandle<()>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct World {
    directory: Arc<InMemoryKeyDirectory>,
    ledger: InMemoryLedger,
    service: Participant,
}

impl World {
    fn new() -> Self {
        init_tracing();
        let directory = Arc::new(InMemoryKeyDirectory::new());
        let service = Participant::register(&directory);
        let ledger = InMemoryLedger::new(directory.clone());
        Self {
            directory,
            ledger,
            service,
        }
    }

    async fn node(&self, who: Participant, config: TicketServiceConfig, install_key: bool) -> Node {
        let tables = InMemoryTableStore::new();
        let facade = TicketService::new(
            config.with_response_timeout(Duration::from_secs(2)),
            Arc::new(self.ledger.client(who.user_id)),
            Arc::new(tables.clone()),
            self.directory.clone(),
            Arc::new(test_clock()),
        );
        if install_key {
            facade.set_signer(who.signer.clone());
        }
        let listener = facade.start().await.unwrap();
        Node {
            who,
            facade,
            tables,
            listener,
        }
    }

    async fn service_node(&self) -> Node {
        let config = TicketServiceConfig::for_service(self.service.user_id);
        self.node(self.service.clone(), config, true).await
    }

    /// Service facade that can issue but answers no signature requests.
    async fn keyless_service_node(&self) -> Node {
        let config = TicketServiceConfig::for_service(self.service.user_id);
        self.node(self.service.clone(), config, false).await
    }

    async fn user_node(&self) -> Node {
        let who = Participant::register(&self.directory);
        let config = TicketServiceConfig::new(self.service.user_id, who.user_id);
        self.node(who, config, true).await
    }
}

fn spec(transferable: bool) -> TicketSpec {
    TicketSpec::new(TicketSpecParams {
        value: 1,
        unit: "person".to_string(),
        transferable,
        ..TicketSpecParams::new(Description::text("Zepp Tokyo:S3-16"))
    })
    .unwrap()
}

async fn wait_for(applied: &mut broadcast::Receiver<TxId>, tx_id: TxId) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if applied.recv().await.unwrap() == tx_id {
                return;
            }
        }
    })
    .await
    .expect("transaction was not applied in time");
}

/// Issue a ticket to `holder` and wait until every listed node has applied it.
async fn issue_to(
    service: &Node,
    holder: &Node,
    transferable: bool,
    others: &[&Node],
) -> (TicketId, TxId) {
    let mut receivers: Vec<_> = std::iter::once(holder)
        .chain(others.iter().copied())
        .map(|node| node.facade.subscribe_applied())
        .collect();
    let (ticket_id, tx) = service
        .facade
        .issue(
            holder.who.user_id,
            spec(transferable),
            None,
            service.who.signer.as_ref(),
        )
        .await
        .unwrap();
    for rx in &mut receivers {
        wait_for(rx, tx.tx_id()).await;
    }
    (ticket_id, tx.tx_id())
}

#[tokio::test]
async fn issue_transfer_redeem() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let bob = world.user_node().await;
    let (a, b, s) = (alice.who.user_id, bob.who.user_id, service.who.user_id);

    let (ticket_id, issue_tx) = issue_to(&service, &alice, true, &[&bob]).await;
    assert!(service.facade.is_valid_holder(a, ticket_id).await.unwrap());
    assert!(alice.facade.is_valid_holder(a, ticket_id).await.unwrap());
    assert_eq!(service.facade.get_balance_of(a).await.unwrap(), 1);

    // alice to bob, the service counter-signs remotely
    let mut service_applied = service.facade.subscribe_applied();
    let mut bob_applied = bob.facade.subscribe_applied();
    let transfer = alice
        .facade
        .transfer(a, b, ticket_id, alice.who.signer.as_ref(), None)
        .await
        .unwrap();
    wait_for(&mut service_applied, transfer.tx_id()).await;
    wait_for(&mut bob_applied, transfer.tx_id()).await;

    for node in [&service, &alice, &bob] {
        assert!(!node.facade.is_valid_holder(a, ticket_id).await.unwrap());
        assert!(node.facade.is_valid_holder(b, ticket_id).await.unwrap());
        assert_eq!(node.tables.utxo_state(issue_tx, 0), Some(UtxoState::Taken));
        assert_eq!(
            node.tables.utxo_state(transfer.tx_id(), 0),
            Some(UtxoState::Free)
        );
    }
    assert_eq!(service.facade.get_balance_of(a).await.unwrap(), 0);
    assert_eq!(service.facade.get_balance_of(b).await.unwrap(), 1);

    // bob gives it back
    let redeem = bob
        .facade
        .redeem(b, ticket_id, bob.who.signer.as_ref(), None)
        .await
        .unwrap();
    wait_for(&mut service_applied, redeem.tx_id()).await;

    assert!(service.facade.is_valid_holder(s, ticket_id).await.unwrap());
    assert!(!service.facade.is_valid_holder(a, ticket_id).await.unwrap());
    assert!(!service.facade.is_valid_holder(b, ticket_id).await.unwrap());
    assert_eq!(service.facade.get_balance_of(s).await.unwrap(), 1);
    assert_eq!(service.facade.get_balance_of(b).await.unwrap(), 0);
    assert_eq!(
        service.tables.utxo_state(transfer.tx_id(), 0),
        Some(UtxoState::Taken)
    );
    assert_eq!(world.ledger.len(), 3);
}

#[tokio::test]
async fn service_signs_locally_when_it_holds_both_keys() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);

    let (ticket_id, _) = issue_to(&service, &alice, true, &[]).await;
    service
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            Some(service.who.signer.as_ref()),
        )
        .await
        .unwrap();

    assert!(
        service
            .facade
            .is_valid_holder(bob.user_id, ticket_id)
            .await
            .unwrap()
    );
    assert!(
        !service
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn non_transferable_ticket_stays_put() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);

    let (ticket_id, _) = issue_to(&service, &alice, false, &[]).await;
    let err = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::Policy(_)), "{err}");
    assert!(
        alice
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );
    assert_eq!(world.ledger.len(), 1);
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let world = World::new();
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);

    let err = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            TicketId::new([7; 32]),
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn service_without_key_denies_and_holder_keeps_ticket() {
    let world = World::new();
    let service = world.keyless_service_node().await;
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);
    let (ticket_id, issue_tx) = issue_to(&service, &alice, true, &[]).await;

    let err = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TicketError::SigningDenied(_)), "{err}");
    assert_eq!(alice.tables.utxo_state(issue_tx, 0), Some(UtxoState::Free));
    assert_eq!(service.tables.utxo_state(issue_tx, 0), Some(UtxoState::Free));
    assert!(
        alice
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );
    assert_eq!(world.ledger.len(), 1);
}

#[tokio::test]
async fn service_refuses_to_sign_a_spent_reference() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);
    let carol = Participant::register(&world.directory);
    let (ticket_id, _) = issue_to(&service, &alice, true, &[]).await;

    // two competing transfers of the same event, built before either lands
    let a = alice.who.user_id;
    let first = alice
        .facade
        .builder()
        .build_transfer(a, bob.user_id, ticket_id, None)
        .await
        .unwrap();
    let second = alice
        .facade
        .builder()
        .build_transfer(a, carol.user_id, ticket_id, None)
        .await
        .unwrap();

    let mut service_applied = service.facade.subscribe_applied();
    let first = alice
        .facade
        .sign_transfer(first, a, alice.who.signer.as_ref(), None)
        .await
        .unwrap();
    wait_for(&mut service_applied, first.tx_id()).await;

    // the holder's own index already refuses
    let err = alice
        .facade
        .sign_transfer(second.clone(), a, alice.who.signer.as_ref(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::Policy(_)), "{err}");

    // and so does the service when asked directly
    let err = world
        .ledger
        .client(a)
        .gather_remote_signature(&second, world.service.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::SignatureDenied { .. }), "{err}");
    assert!(
        !service
            .facade
            .is_valid_holder(carol.user_id, ticket_id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn offline_store_reports_nothing() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let (ticket_id, _) = issue_to(&service, &alice, true, &[]).await;

    service.facade.store().set_online(false);
    assert!(
        !service
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );
    assert_eq!(
        service
            .facade
            .get_balance_of(alice.who.user_id)
            .await
            .unwrap(),
        0
    );

    service.facade.store().set_online(true);
    assert!(
        service
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn rejected_submission_is_reported() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;

    world.ledger.reject_next("quota exceeded");
    let err = service
        .facade
        .issue(
            alice.who.user_id,
            spec(true),
            None,
            service.who.signer.as_ref(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::Submission(_)), "{err}");
    assert!(err.is_retryable());
    assert!(world.ledger.is_empty());
    assert_eq!(service.facade.get_balance_of(alice.who.user_id).await.unwrap(), 0);
}

#[tokio::test]
async fn lost_counter_signature_releases_holder_reservation() {
    let world = World::new();
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);

    // the service issues but is not listening for signature requests yet
    let service_tables = InMemoryTableStore::new();
    let service = TicketService::new(
        TicketServiceConfig::for_service(world.service.user_id)
            .with_response_timeout(Duration::from_millis(100)),
        Arc::new(world.ledger.client(world.service.user_id)),
        Arc::new(service_tables.clone()),
        world.directory.clone(),
        Arc::new(test_clock()),
    );
    let mut alice_applied = alice.facade.subscribe_applied();
    let (ticket_id, issue) = service
        .issue(
            alice.who.user_id,
            spec(true),
            None,
            world.service.signer.as_ref(),
        )
        .await
        .unwrap();
    wait_for(&mut alice_applied, issue.tx_id()).await;

    let err = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::Ledger(LedgerError::Transport(_))), "{err}");
    assert!(err.is_retryable());
    assert_eq!(alice.tables.utxo_state(issue.tx_id(), 0), Some(UtxoState::Free));
    assert!(
        alice
            .facade
            .is_valid_holder(alice.who.user_id, ticket_id)
            .await
            .unwrap()
    );

    // once the service catches up and listens, the same transfer goes through
    service
        .handle_notification(LedgerNotification::TransactionAccepted {
            tx_id: issue.tx_id(),
        })
        .await
        .unwrap();
    service.set_signer(world.service.signer.clone());
    let listener = service.start().await.unwrap();
    let mut service_applied = service.subscribe_applied();

    let transfer = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap();
    wait_for(&mut alice_applied, transfer.tx_id()).await;
    wait_for(&mut service_applied, transfer.tx_id()).await;
    assert!(alice.facade.is_valid_holder(bob.user_id, ticket_id).await.unwrap());
    assert_eq!(
        service_tables.utxo_state(issue.tx_id(), 0),
        Some(UtxoState::Taken)
    );
    listener.abort();
}

#[tokio::test]
async fn service_that_cannot_cache_denies_and_releases() {
    let world = World::new();
    let service = world.service_node().await;
    let alice = world.user_node().await;
    let bob = Participant::register(&world.directory);
    let (ticket_id, issue_tx) = issue_to(&service, &alice, true, &[]).await;

    service.tables.fail_next_insert_tx("disk full");
    let err = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TicketError::SigningDenied(_)), "{err}");
    assert_eq!(alice.tables.utxo_state(issue_tx, 0), Some(UtxoState::Free));
    assert_eq!(service.tables.utxo_state(issue_tx, 0), Some(UtxoState::Free));

    let mut service_applied = service.facade.subscribe_applied();
    let transfer = alice
        .facade
        .transfer(
            alice.who.user_id,
            bob.user_id,
            ticket_id,
            alice.who.signer.as_ref(),
            None,
        )
        .await
        .unwrap();
    wait_for(&mut service_applied, transfer.tx_id()).await;
    assert!(
        service
            .facade
            .is_valid_holder(bob.user_id, ticket_id)
            .await
            .unwrap()
    );
}
