//! End-to-end lifecycle scenarios against the in-memory ledger.
//!
//! Two plugins share one mock ledger, so every submission one side makes is
//! observed by the other through the validated-event stream, exactly like
//! two peers watching the same accounts.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use xrp_escrow_plugin::LedgerClient;
use xrp_escrow_plugin::ledger::mock::MockLedger;
use xrp_escrow_plugin::ledger::{
    AffectedNode, EscrowFields, MemoWrapper, NodeDiff, RawTransaction, TransactionEvent,
    TransactionMeta, TxType,
};
use xrp_escrow_plugin::translate::{ID_REL, ILP_REL, utc_to_ledger_time};
use xrp_escrow_plugin::{
    Direction, EscrowPlugin, Fulfillment, HandlerError, Message, PluginConfig, PluginError,
    PluginEvent, RequestHandler, TransferRequest,
};

const PREFIX: &str = "g.crypto.ripple.";

struct Peer {
    plugin: EscrowPlugin,
    events: broadcast::Receiver<PluginEvent>,
    address: String,
}

impl Peer {
    fn account(&self) -> String {
        format!("{PREFIX}{}", self.address)
    }
}

async fn spawn_peer(ledger: &Arc<MockLedger>, secret: &str, grace_ms: u64) -> Peer {
    let address = ledger.derive_address(secret).unwrap();
    ledger.fund(&address, 100_000_000);

    let mut config = PluginConfig::new("mock://ledger", secret);
    config.expiry_grace_ms = grace_ms;
    config.cancel_retry_delay_ms = 10;

    let plugin = EscrowPlugin::new(config, ledger.clone()).unwrap();
    let mut events = plugin.subscribe();
    plugin.connect().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        PluginEvent::Connect
    ));

    Peer {
        plugin,
        events,
        address,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<PluginEvent>) -> PluginEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for plugin event")
        .expect("event channel closed")
}

/// Collect everything emitted within `window`.
async fn drain_events(rx: &mut broadcast::Receiver<PluginEvent>, window: Duration) -> Vec<PluginEvent> {
    let mut drained = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        drained.push(event);
    }
    drained
}

fn transfer_request(id: &str, to: &str, amount: u64, preimage: &[u8], expires_in: i64) -> TransferRequest {
    TransferRequest {
        id: id.to_string(),
        to: to.to_string(),
        amount,
        ilp: "AYIBAQAA".to_string(),
        execution_condition: Fulfillment::new(preimage.to_vec()).condition(),
        expires_at: chrono::Utc::now() + chrono::Duration::seconds(expires_in),
        note_to_self: Some(serde_json::json!({"memo": "mine"})),
    }
}

#[tokio::test]
async fn test_prepare_and_fulfill_lifecycle() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    alice
        .plugin
        .send_transfer(transfer_request("t1", &bob.account(), 1_000_000, b"secret", 60))
        .await
        .unwrap();

    match next_event(&mut alice.events).await {
        PluginEvent::Prepare { direction, transfer } => {
            assert_eq!(direction, Direction::Outgoing);
            assert_eq!(transfer.id, "t1");
            assert_eq!(transfer.amount, 1_000_000);
            assert_eq!(transfer.to, bob.account());
            assert_eq!(transfer.from, alice.account());
            assert_eq!(transfer.ilp, "AYIBAQAA");
            // The sender-local note never crosses the ledger but rides the
            // sender's own events.
            assert_eq!(
                transfer.note_to_self,
                Some(serde_json::json!({"memo": "mine"}))
            );
        }
        other => panic!("expected outgoing prepare, got {}", other.name()),
    }

    match next_event(&mut bob.events).await {
        PluginEvent::Prepare { direction, transfer } => {
            assert_eq!(direction, Direction::Incoming);
            assert_eq!(transfer.id, "t1");
            assert_eq!(transfer.note_to_self, None);
        }
        other => panic!("expected incoming prepare, got {}", other.name()),
    }

    // The receiver reveals the preimage.
    let fulfillment = Fulfillment::new(b"secret".to_vec());
    bob.plugin
        .fulfill_condition("t1", fulfillment.clone())
        .await
        .unwrap();

    match next_event(&mut alice.events).await {
        PluginEvent::Fulfill {
            direction,
            transfer,
            fulfillment: revealed,
        } => {
            assert_eq!(direction, Direction::Outgoing);
            assert_eq!(transfer.id, "t1");
            assert_eq!(revealed.preimage(), b"secret");
        }
        other => panic!("expected outgoing fulfill, got {}", other.name()),
    }
    assert!(matches!(
        next_event(&mut bob.events).await,
        PluginEvent::Fulfill { direction: Direction::Incoming, .. }
    ));

    assert_eq!(
        alice.plugin.get_fulfillment("t1").unwrap().to_protocol(),
        fulfillment.to_protocol()
    );
    assert_eq!(
        bob.plugin.get_fulfillment("t1").unwrap().preimage(),
        b"secret"
    );

    // Escrowed funds landed with the receiver.
    assert_eq!(bob.plugin.get_balance().await.unwrap(), 101_000_000);

    // Fulfilling again is idempotent.
    bob.plugin.fulfill_condition("t1", fulfillment).await.unwrap();
}

#[tokio::test]
async fn test_fulfill_rejects_wrong_preimage_and_unknown_transfer() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    alice
        .plugin
        .send_transfer(transfer_request("t1", &bob.account(), 500, b"secret", 60))
        .await
        .unwrap();
    let _ = next_event(&mut alice.events).await;
    let _ = next_event(&mut bob.events).await;

    let err = bob
        .plugin
        .fulfill_condition("t1", Fulfillment::new(b"wrong".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::InvalidFields(_)));

    let err = bob
        .plugin
        .fulfill_condition("no-such-transfer", Fulfillment::new(b"secret".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::TransferNotFound(_)));

    // Still pending: not cancelled, no fulfillment yet.
    assert!(matches!(
        bob.plugin.get_fulfillment("t1"),
        Err(PluginError::MissingFulfillment(_))
    ));
}

#[tokio::test]
async fn test_expired_transfer_is_cancelled() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 0).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 0).await;

    // Already expired: the scheduler fires immediately after preparation.
    alice
        .plugin
        .send_transfer(transfer_request("t2", &bob.account(), 2_000, b"secret", -1))
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut alice.events).await,
        PluginEvent::Prepare { direction: Direction::Outgoing, .. }
    ));
    match next_event(&mut alice.events).await {
        PluginEvent::Cancel { direction, transfer } => {
            assert_eq!(direction, Direction::Outgoing);
            assert_eq!(transfer.id, "t2");
        }
        other => panic!("expected outgoing cancel, got {}", other.name()),
    }

    let bob_events = drain_events(&mut bob.events, Duration::from_millis(300)).await;
    assert!(bob_events.iter().any(|e| matches!(
        e,
        PluginEvent::Cancel { direction: Direction::Incoming, .. }
    )));

    assert!(matches!(
        alice.plugin.get_fulfillment("t2"),
        Err(PluginError::AlreadyRolledBack(_))
    ));

    // Escrowed funds returned to the sender.
    assert_eq!(alice.plugin.get_balance().await.unwrap(), 100_000_000);
}

#[tokio::test]
async fn test_fulfillment_wins_the_expiry_race() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 0).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 0).await;

    // Expires one second out: enough room to fulfill first, short enough
    // that both expiry timers fire inside the test window.
    alice
        .plugin
        .send_transfer(transfer_request("t4", &bob.account(), 3_000, b"secret", 1))
        .await
        .unwrap();
    let _ = next_event(&mut bob.events).await;
    bob.plugin
        .fulfill_condition("t4", Fulfillment::new(b"secret".to_vec()))
        .await
        .unwrap();

    // Let both expiry timers fire and lose against the settled escrow.
    let alice_events = drain_events(&mut alice.events, Duration::from_millis(1_400)).await;
    let fulfills = alice_events
        .iter()
        .filter(|e| matches!(e, PluginEvent::Fulfill { .. }))
        .count();
    let cancels = alice_events
        .iter()
        .filter(|e| matches!(e, PluginEvent::Cancel { .. }))
        .count();
    assert_eq!(fulfills, 1);
    assert_eq!(cancels, 0);

    assert_eq!(
        alice.plugin.get_fulfillment("t4").unwrap().preimage(),
        b"secret"
    );
}

#[tokio::test]
async fn test_cancellation_retries_transient_rejection() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 0).await;
    let bob_address = ledger.derive_address("bob-secret").unwrap();

    // Expires one second out; the transient failure is queued before the
    // timer fires so the first cancellation is rejected.
    alice
        .plugin
        .send_transfer(transfer_request(
            "t5",
            &format!("{PREFIX}{bob_address}"),
            4_000,
            b"secret",
            1,
        ))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut alice.events).await,
        PluginEvent::Prepare { .. }
    ));
    ledger.fail_next_submission("terRETRY");

    // The retry lands the cancellation despite the first rejection.
    match next_event(&mut alice.events).await {
        PluginEvent::Cancel { transfer, .. } => assert_eq!(transfer.id, "t5"),
        other => panic!("expected cancel after retry, got {}", other.name()),
    }
    assert_eq!(ledger.escrow_count(), 0);
}

#[tokio::test]
async fn test_unknown_hash_and_foreign_events_are_ignored() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    // A validated payment between strangers: no pending hash, no direction.
    ledger.broadcast(TransactionEvent {
        validated: true,
        engine_result: "tesSUCCESS".into(),
        transaction: RawTransaction {
            transaction_type: TxType::Payment,
            account: "rSTRANGER_ONE".into(),
            destination: Some("rSTRANGER_TWO".into()),
            amount: Some("1".into()),
            sequence: Some(1),
            owner: None,
            offer_sequence: None,
            condition: None,
            fulfillment: None,
            cancel_after: None,
            memos: None,
            hash: "F00D".into(),
        },
        meta: TransactionMeta::default(),
    });

    assert!(drain_events(&mut alice.events, Duration::from_millis(150))
        .await
        .is_empty());

    // The engine keeps working afterwards.
    alice
        .plugin
        .send_transfer(transfer_request("t6", &bob.account(), 100, b"secret", 60))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut alice.events).await,
        PluginEvent::Prepare { .. }
    ));
}

#[tokio::test]
async fn test_duplicate_creation_event_prepares_once() {
    let ledger = Arc::new(MockLedger::new());
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    // An incoming escrow created by a peer whose plugin we do not run.
    let condition = Fulfillment::new(b"secret".to_vec()).condition();
    let expires = chrono::Utc::now() + chrono::Duration::seconds(60);
    let event = TransactionEvent {
        validated: true,
        engine_result: "tesSUCCESS".into(),
        transaction: RawTransaction {
            transaction_type: TxType::EscrowCreate,
            account: "rCHARLIE".into(),
            destination: Some(bob.address.clone()),
            amount: Some("7000".into()),
            sequence: Some(11),
            owner: None,
            offer_sequence: None,
            condition: Some(condition.to_ledger()),
            fulfillment: None,
            cancel_after: Some(utc_to_ledger_time(&expires)),
            memos: Some(vec![
                MemoWrapper::from_plain(ID_REL, b"t7"),
                MemoWrapper::from_plain(ILP_REL, b"AQ"),
            ]),
            hash: "DUP1".into(),
        },
        meta: TransactionMeta {
            affected_nodes: vec![AffectedNode {
                created: Some(NodeDiff {
                    ledger_entry_type: "Escrow".into(),
                    ledger_index: "C0FFEE".into(),
                    new_fields: Some(EscrowFields {
                        account: "rCHARLIE".into(),
                        destination: bob.address.clone(),
                        amount: "7000".into(),
                        condition: Some(condition.to_ledger()),
                        cancel_after: Some(utc_to_ledger_time(&expires)),
                    }),
                    final_fields: None,
                }),
                ..Default::default()
            }],
        },
    };

    ledger.broadcast(event.clone());
    ledger.broadcast(event);

    let events = drain_events(&mut bob.events, Duration::from_millis(300)).await;
    let prepares = events
        .iter()
        .filter(|e| matches!(e, PluginEvent::Prepare { .. }))
        .count();
    assert_eq!(prepares, 1);
}

#[tokio::test]
async fn test_plain_messages() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    alice
        .plugin
        .send_message(Message::new(bob.account(), serde_json::json!({"hello": "bob"})))
        .await
        .unwrap();

    match next_event(&mut bob.events).await {
        PluginEvent::Message { direction, message } => {
            assert_eq!(direction, Direction::Incoming);
            assert_eq!(message.data, serde_json::json!({"hello": "bob"}));
            assert_eq!(message.from.as_deref(), Some(alice.account().as_str()));
        }
        other => panic!("expected incoming message, got {}", other.name()),
    }
    assert!(matches!(
        next_event(&mut alice.events).await,
        PluginEvent::Message { direction: Direction::Outgoing, .. }
    ));
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let ledger = Arc::new(MockLedger::new());
    let alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    let mut request = Message::new(bob.account(), serde_json::json!({"method": "ping"}));
    request.timeout_ms = Some(100);

    let started = tokio::time::Instant::now();
    let err = alice.plugin.send_request(request).await.unwrap_err();
    assert!(matches!(err, PluginError::RequestTimedOut(_)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));
}

struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Message) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({"echo": request.data}))
    }
}

struct FailingHandler;

#[async_trait::async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(&self, _request: Message) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::new("F00", "no quote available"))
    }
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let ledger = Arc::new(MockLedger::new());
    let mut alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let mut bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    bob.plugin
        .register_request_handler(Arc::new(EchoHandler))
        .unwrap();

    let request = Message::new(bob.account(), serde_json::json!({"method": "ping"}));
    let response = alice.plugin.send_request(request).await.unwrap();
    assert_eq!(
        response.data,
        serde_json::json!({"echo": {"method": "ping"}})
    );

    let alice_events = drain_events(&mut alice.events, Duration::from_millis(200)).await;
    assert!(alice_events.iter().any(|e| matches!(
        e,
        PluginEvent::Request { direction: Direction::Outgoing, .. }
    )));
    assert!(alice_events.iter().any(|e| matches!(
        e,
        PluginEvent::Response { direction: Direction::Incoming, .. }
    )));

    let bob_events = drain_events(&mut bob.events, Duration::from_millis(200)).await;
    assert!(bob_events.iter().any(|e| matches!(
        e,
        PluginEvent::Request { direction: Direction::Incoming, .. }
    )));
    assert!(bob_events.iter().any(|e| matches!(
        e,
        PluginEvent::Response { direction: Direction::Outgoing, .. }
    )));
}

#[tokio::test]
async fn test_failing_handler_relays_structured_error() {
    let ledger = Arc::new(MockLedger::new());
    let alice = spawn_peer(&ledger, "alice-secret", 5_000).await;
    let bob = spawn_peer(&ledger, "bob-secret", 5_000).await;

    bob.plugin
        .register_request_handler(Arc::new(FailingHandler))
        .unwrap();

    let request = Message::new(bob.account(), serde_json::json!({"method": "quote"}));
    let response = alice.plugin.send_request(request).await.unwrap();

    let error = &response.data["error"];
    assert_eq!(error["code"], "F00");
    assert_eq!(error["message"], "no quote available");
    assert_eq!(error["triggeredBy"], bob.account());
}
