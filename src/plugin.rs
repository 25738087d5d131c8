//! Escrow plugin engine
//!
//! Ties the pieces together: caller intent flows down through the serialized
//! submission queue and the submission correlator into ledger-client calls;
//! the validated-event stream flows up through the translator into lifecycle
//! events and promise resolutions.
//!
//! One task consumes the event stream; each event is fully handled,
//! including cache mutation, before the next is processed. Finish and cancel
//! events depend on the creation event having populated the locator cache,
//! so that ordering is load-bearing, not cosmetic.

use crate::condition::Fulfillment;
use crate::config::PluginConfig;
use crate::core_types::{Direction, Drops, LedgerAddress, TransferId};
use crate::errors::PluginError;
use crate::events::{Message, PluginEvent};
use crate::expiry::{ExpiryContext, watch_expiry};
use crate::ledger::{
    EscrowCreation, EscrowExecution, LedgerClient, MemoSpec, PaymentSpec, RESULT_SUCCESS,
    TransactionEvent, TxType,
};
use crate::models::{LedgerInfo, TransferRequest, drops_to_xrp, xrp_to_drops};
use crate::queue::SerialQueue;
use crate::rpc::{PendingRequests, RequestHandler};
use crate::store::{TransferOutcome, TransferStore};
use crate::submit::PendingSubmissions;
use crate::translate::{
    FULFILLMENT_REL, ID_REL, ILP_REL, MESSAGE_ID_REL, MESSAGE_REL, TranslateError, Translator,
    finish_fulfillment,
};
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Messages ride the minimum transferable payment: one drop.
const MESSAGE_AMOUNT: &str = "0.000001";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The escrow-transfer lifecycle engine.
///
/// Cheap to clone; clones share one engine instance. Must be created inside
/// a tokio runtime (the submission queue worker is spawned at construction).
#[derive(Clone)]
pub struct EscrowPlugin {
    inner: Arc<PluginInner>,
}

impl std::fmt::Debug for EscrowPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowPlugin")
            .field("address", &self.inner.address)
            .field("prefix", &self.inner.prefix)
            .finish_non_exhaustive()
    }
}

struct PluginInner {
    config: PluginConfig,
    address: LedgerAddress,
    prefix: String,
    client: Arc<dyn LedgerClient>,
    translator: Translator,
    store: Arc<Mutex<TransferStore>>,
    pending_tx: Arc<PendingSubmissions>,
    pending_rpc: Arc<PendingRequests>,
    outgoing_responses: DashSet<String>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    events: broadcast::Sender<PluginEvent>,
    queue: SerialQueue,
    connected: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl EscrowPlugin {
    /// Validate the configuration and build the engine. The configured
    /// address, when present, must match the address derived from the
    /// secret.
    pub fn new(config: PluginConfig, client: Arc<dyn LedgerClient>) -> Result<Self, PluginError> {
        config.validate()?;

        let derived = client.derive_address(&config.secret).map_err(|e| {
            PluginError::InvalidFields(format!("cannot derive address from secret: {e}"))
        })?;
        if let Some(address) = &config.address
            && address != &derived
        {
            return Err(PluginError::InvalidFields(format!(
                "address does not correspond to secret: configured={address} derived={derived}"
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let prefix = config.prefix.clone();
        let inner = Arc::new(PluginInner {
            translator: Translator::new(derived.clone(), prefix.clone()),
            address: derived,
            prefix,
            client,
            store: Arc::new(Mutex::new(TransferStore::new())),
            pending_tx: Arc::new(PendingSubmissions::new()),
            pending_rpc: Arc::new(PendingRequests::new()),
            outgoing_responses: DashSet::new(),
            handler: RwLock::new(None),
            events,
            queue: SerialQueue::spawn(),
            connected: AtomicBool::new(false),
            event_task: Mutex::new(None),
            config,
        });
        Ok(Self { inner })
    }

    /// Connect the ledger client, subscribe to validated transactions for
    /// our account and start the event loop.
    pub async fn connect(&self) -> Result<(), PluginError> {
        if self.is_connected() {
            return Ok(());
        }

        debug!("connecting to ledger");
        self.inner.client.connect().await?;
        let mut stream = self.inner.client.subscribe(&self.inner.address).await?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                inner.handle_event(event).await;
            }
            debug!("validated-event stream ended");
        });
        *self.inner.event_task.lock().unwrap() = Some(task);

        self.inner.connected.store(true, Ordering::SeqCst);
        info!(address = %self.inner.address, "connected to ledger");
        self.inner.emit(PluginEvent::Connect);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), PluginError> {
        if let Some(task) = self.inner.event_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.client.disconnect().await?;
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!("disconnected from ledger");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.inner.events.subscribe()
    }

    /// This engine's prefixed protocol address.
    pub fn get_account(&self) -> String {
        format!("{}{}", self.inner.prefix, self.inner.address)
    }

    pub fn get_info(&self) -> LedgerInfo {
        LedgerInfo::new(&self.inner.prefix)
    }

    /// Account balance in drops.
    pub async fn get_balance(&self) -> Result<Drops, PluginError> {
        self.ensure_connected()?;
        let info = self
            .inner
            .client
            .get_account_info(&self.inner.address)
            .await?;
        xrp_to_drops(&info.xrp_balance)
    }

    /// Create an escrowed transfer. Resolves once the creation transaction
    /// validates; the corresponding `outgoing_prepare` event follows from
    /// the stream.
    ///
    /// Creations are serialized through the submission queue so account
    /// sequence numbers are consumed strictly in order.
    pub async fn send_transfer(&self, request: TransferRequest) -> Result<(), PluginError> {
        self.ensure_connected()?;
        if request.amount == 0 {
            return Err(PluginError::InvalidFields("amount must be positive".into()));
        }
        let destination = self.inner.local_address(&request.to)?;

        if let Some(note) = &request.note_to_self {
            self.inner
                .store
                .lock()
                .unwrap()
                .set_note(&request.id, note.clone());
        }

        debug!(transfer_id = %request.id, amount = request.amount, "queueing escrow creation");
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .run(async move { inner.create_escrow(request, destination).await })
            .await?
    }

    /// Finish a prepared transfer by revealing the preimage. Resolves once
    /// the finish transaction validates.
    pub async fn fulfill_condition(
        &self,
        transfer_id: &str,
        fulfillment: Fulfillment,
    ) -> Result<(), PluginError> {
        self.ensure_connected()?;

        let (locator, condition) = {
            let store = self.inner.store.lock().unwrap();
            let record = store
                .get(transfer_id)
                .ok_or_else(|| PluginError::TransferNotFound(transfer_id.to_string()))?;
            match record.outcome {
                Some(TransferOutcome::Cancelled) => {
                    return Err(PluginError::AlreadyRolledBack(transfer_id.to_string()));
                }
                Some(TransferOutcome::Fulfilled) => {
                    debug!(transfer_id, "transfer already fulfilled, nothing to do");
                    return Ok(());
                }
                None => {}
            }
            (
                record.locator.clone(),
                record.transfer.execution_condition,
            )
        };

        if fulfillment.condition() != condition {
            return Err(PluginError::InvalidFields(
                "fulfillment does not hash to the transfer's execution condition".into(),
            ));
        }

        debug!(transfer_id, locator = %locator, "preparing escrow execution");
        let prepared = self
            .inner
            .client
            .prepare_escrow_execution(
                &self.inner.address,
                EscrowExecution {
                    owner: locator.owner,
                    escrow_sequence: locator.sequence,
                    condition: condition.to_ledger(),
                    fulfillment: fulfillment.to_ledger(),
                    memos: vec![MemoSpec::new(
                        FULFILLMENT_REL,
                        fulfillment.to_protocol().into_bytes(),
                    )],
                },
            )
            .await?;
        let signed = self
            .inner
            .client
            .sign(&prepared.tx_json, &self.inner.config.secret)?;
        debug!(transfer_id, hash = %signed.id, "submitting escrow execution");
        self.inner
            .pending_tx
            .submit_and_confirm(self.inner.client.as_ref(), &signed)
            .await
    }

    /// The fulfillment revealed for a finished transfer. Distinguishes
    /// never-seen, already-cancelled and still-pending transfers.
    pub fn get_fulfillment(&self, transfer_id: &str) -> Result<Fulfillment, PluginError> {
        self.inner.store.lock().unwrap().fulfillment(transfer_id)
    }

    /// Send a point-to-point message in a payment memo. Resolves once the
    /// payment validates.
    pub async fn send_message(&self, message: Message) -> Result<(), PluginError> {
        self.ensure_connected()?;
        self.inner.deliver(message).await
    }

    /// Send a request and wait for the correlated response, racing the
    /// configured (or per-message) timeout.
    pub async fn send_request(&self, mut message: Message) -> Result<Message, PluginError> {
        self.ensure_connected()?;

        let id = message
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let timeout = message
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.request_timeout());

        let response = self.inner.pending_rpc.register(&id);
        self.inner.emit(PluginEvent::Request {
            direction: Direction::Outgoing,
            message: message.clone(),
        });

        let deliver_and_wait = async {
            self.inner.deliver(message).await?;
            response
                .await
                .map_err(|_| PluginError::Internal("pending request dropped".into()))
        };

        match tokio::time::timeout(timeout, deliver_and_wait).await {
            Ok(result) => {
                if result.is_err() {
                    self.inner.pending_rpc.remove(&id);
                }
                result
            }
            Err(_) => {
                self.inner.pending_rpc.remove(&id);
                debug!(request_id = %id, "request timed out");
                Err(PluginError::RequestTimedOut(id))
            }
        }
    }

    /// Install the single handler for inbound requests.
    pub fn register_request_handler(
        &self,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), PluginError> {
        let mut slot = self.inner.handler.write().unwrap();
        if slot.is_some() {
            return Err(PluginError::InvalidFields(
                "request handler already registered".into(),
            ));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn deregister_request_handler(&self) {
        *self.inner.handler.write().unwrap() = None;
    }

    fn ensure_connected(&self) -> Result<(), PluginError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PluginError::NotConnected)
        }
    }
}

impl PluginInner {
    fn emit(&self, event: PluginEvent) {
        trace!(event = %event.name(), "emitting");
        let _ = self.events.send(event);
    }

    /// Strip our prefix and take the bare ledger account.
    fn local_address(&self, to: &str) -> Result<String, PluginError> {
        let rest = to.strip_prefix(&self.prefix).ok_or_else(|| {
            PluginError::InvalidFields(format!(
                "destination {to} is not on ledger {}",
                self.prefix
            ))
        })?;
        let local = rest.split('.').next().unwrap_or_default();
        if local.is_empty() {
            return Err(PluginError::InvalidFields(format!(
                "destination {to} has no ledger account"
            )));
        }
        Ok(local.to_string())
    }

    /// Prepare, sign and submit one escrow creation. Runs on the submission
    /// queue worker, one creation at a time.
    async fn create_escrow(
        &self,
        request: TransferRequest,
        destination: String,
    ) -> Result<(), PluginError> {
        let params = EscrowCreation {
            amount: drops_to_xrp(request.amount),
            destination,
            condition: request.execution_condition.to_ledger(),
            allow_cancel_after: request.expires_at,
            memos: vec![
                MemoSpec::new(ILP_REL, request.ilp.as_bytes().to_vec()),
                MemoSpec::new(ID_REL, request.id.as_bytes().to_vec()),
            ],
        };
        let prepared = self
            .client
            .prepare_escrow_creation(&self.address, params)
            .await?;
        let signed = self.client.sign(&prepared.tx_json, &self.config.secret)?;
        debug!(transfer_id = %request.id, hash = %signed.id, "submitting escrow creation");
        self.pending_tx
            .submit_and_confirm(self.client.as_ref(), &signed)
            .await
    }

    /// Build a payment carrying the message memos and submit it.
    async fn deliver(&self, mut message: Message) -> Result<(), PluginError> {
        let destination = self.local_address(&message.to)?;
        let id = message
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let data = serde_json::to_vec(&message.data)
            .map_err(|e| PluginError::Internal(format!("unserializable message data: {e}")))?;

        let params = PaymentSpec {
            destination,
            amount: MESSAGE_AMOUNT.to_string(),
            memos: vec![
                MemoSpec::new(MESSAGE_REL, data),
                MemoSpec::new(MESSAGE_ID_REL, id.clone().into_bytes()),
            ],
        };
        let prepared = self.client.prepare_payment(&self.address, params).await?;
        let signed = self.client.sign(&prepared.tx_json, &self.config.secret)?;
        debug!(message_id = %id, hash = %signed.id, "submitting message payment");
        self.pending_tx
            .submit_and_confirm(self.client.as_ref(), &signed)
            .await
    }

    /// One validated event, handled to completion before the next.
    async fn handle_event(self: &Arc<Self>, event: TransactionEvent) {
        if !event.validated {
            return;
        }

        // Settle any in-flight submission first so callers unblock even when
        // the transaction itself is not translatable.
        self.pending_tx.resolve(&event);

        if event.engine_result != RESULT_SUCCESS {
            trace!(
                hash = %event.transaction.hash,
                engine_result = %event.engine_result,
                "skipping unsuccessful transaction"
            );
            return;
        }

        let result = match event.transaction.transaction_type {
            TxType::EscrowCreate => self.on_escrow_create(&event),
            TxType::EscrowFinish => self.on_escrow_finish(&event),
            TxType::EscrowCancel => self.on_escrow_cancel(&event),
            TxType::Payment => self.on_payment(&event),
            TxType::Other => Ok(()),
        };

        if let Err(e) = result {
            match e {
                // The account subscription carries traffic that is not ours;
                // dropping it is routine, not an incident.
                TranslateError::ForeignTransaction => {
                    trace!(hash = %event.transaction.hash, "ignoring foreign transaction")
                }
                TranslateError::UnknownEscrow(_) => {
                    debug!(hash = %event.transaction.hash, error = %e, "dropping event for unknown escrow")
                }
                _ => {
                    warn!(hash = %event.transaction.hash, error = %e, "dropping untranslatable event")
                }
            }
        }
    }

    fn on_escrow_create(self: &Arc<Self>, event: &TransactionEvent) -> Result<(), TranslateError> {
        let (translated, newly_prepared) = {
            let mut store = self.store.lock().unwrap();
            let translated = self.translator.escrow_to_transfer(&mut store, event)?;
            let newly_prepared = store.record_prepared(
                &translated.transfer,
                translated.locator.clone(),
                &translated.ledger_index,
            );
            (translated, newly_prepared)
        };

        if !newly_prepared {
            debug!(transfer_id = %translated.transfer.id, "duplicate creation event, no-op");
            return Ok(());
        }

        let transfer = translated.transfer;
        info!(
            transfer_id = %transfer.id,
            direction = %transfer.direction,
            amount = transfer.amount,
            "escrow prepared"
        );

        // Arm the cancellation timer. Cancelling an expired escrow is
        // permissionless, so both sides may watch it; the terminal outcome
        // decides the race.
        tokio::spawn(watch_expiry(
            self.expiry_ctx(),
            transfer.id.clone(),
            transfer.expires_at,
        ));

        self.emit(PluginEvent::Prepare {
            direction: transfer.direction,
            transfer,
        });
        Ok(())
    }

    fn on_escrow_finish(self: &Arc<Self>, event: &TransactionEvent) -> Result<(), TranslateError> {
        let fulfillment = finish_fulfillment(event)?;

        let (translated, newly_terminal) = {
            let mut store = self.store.lock().unwrap();
            let translated = self.translator.escrow_to_transfer(&mut store, event)?;

            if fulfillment.condition() != translated.transfer.execution_condition {
                // The ledger already enforced the condition; a mismatch here
                // means the client relayed something inconsistent.
                warn!(
                    transfer_id = %translated.transfer.id,
                    "revealed preimage does not hash to the committed condition"
                );
            }

            let newly_terminal =
                store.mark_fulfilled(&translated.transfer.id, fulfillment.clone());
            (translated, newly_terminal)
        };

        if !newly_terminal {
            debug!(transfer_id = %translated.transfer.id, "finish event on settled transfer, no-op");
            return Ok(());
        }

        let transfer = translated.transfer;
        info!(transfer_id = %transfer.id, direction = %transfer.direction, "escrow fulfilled");
        self.schedule_eviction(&transfer.id);
        self.emit(PluginEvent::Fulfill {
            direction: transfer.direction,
            transfer,
            fulfillment,
        });
        Ok(())
    }

    fn on_escrow_cancel(self: &Arc<Self>, event: &TransactionEvent) -> Result<(), TranslateError> {
        let (translated, newly_terminal) = {
            let mut store = self.store.lock().unwrap();
            let translated = self.translator.escrow_to_transfer(&mut store, event)?;
            let newly_terminal = store.mark_cancelled(&translated.transfer.id);
            (translated, newly_terminal)
        };

        if !newly_terminal {
            debug!(transfer_id = %translated.transfer.id, "cancel event on settled transfer, no-op");
            return Ok(());
        }

        let transfer = translated.transfer;
        info!(transfer_id = %transfer.id, direction = %transfer.direction, "escrow cancelled");
        self.schedule_eviction(&transfer.id);
        self.emit(PluginEvent::Cancel {
            direction: transfer.direction,
            transfer,
        });
        Ok(())
    }

    fn on_payment(self: &Arc<Self>, event: &TransactionEvent) -> Result<(), TranslateError> {
        let (message, direction) = self.translator.payment_to_message(event)?;
        let id = message.id.clone().unwrap_or_default();

        match direction {
            Direction::Outgoing => {
                if self.outgoing_responses.remove(&id).is_some() {
                    self.emit(PluginEvent::Response { direction, message });
                } else if self.pending_rpc.contains(&id) {
                    // Our own request payment validating; the request event
                    // was already emitted at dispatch.
                    trace!(message_id = %id, "request payment validated");
                } else {
                    self.emit(PluginEvent::Message { direction, message });
                }
            }
            Direction::Incoming => {
                if self.pending_rpc.resolve(&id, message.clone()) {
                    self.emit(PluginEvent::Response { direction, message });
                } else if let Some(handler) = self.handler.read().unwrap().clone() {
                    self.emit(PluginEvent::Request {
                        direction,
                        message: message.clone(),
                    });
                    // The response round-trips through the ledger; it must
                    // not block the event loop that will validate it.
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.respond_to_request(handler, message).await;
                    });
                } else {
                    self.emit(PluginEvent::Message { direction, message });
                }
            }
        }
        Ok(())
    }

    async fn respond_to_request(
        self: &Arc<Self>,
        handler: Arc<dyn RequestHandler>,
        request: Message,
    ) {
        let Some(reply_to) = request.from.clone() else {
            error!("inbound request has no source address, cannot respond");
            return;
        };
        let id = request.id.clone();

        let data = match handler.handle(request).await {
            Ok(value) => value,
            Err(e) => {
                warn!(code = %e.code, "request handler failed, relaying error to peer");
                serde_json::json!({
                    "error": {
                        "code": e.code,
                        "message": e.message,
                        "triggeredBy": format!("{}{}", self.prefix, self.address),
                    }
                })
            }
        };

        let mut response = Message::new(reply_to, data);
        response.id = id.clone();
        if let Some(id) = &id {
            self.outgoing_responses.insert(id.clone());
        }
        if let Err(e) = self.deliver(response).await {
            if let Some(id) = &id {
                self.outgoing_responses.remove(id);
            }
            error!(error = %e, "failed to deliver response");
        }
    }

    fn expiry_ctx(&self) -> ExpiryContext {
        ExpiryContext {
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            pending: Arc::clone(&self.pending_tx),
            address: self.address.clone(),
            secret: self.config.secret.clone(),
            grace: self.config.expiry_grace(),
            retry: self.config.cancel_retry,
            retry_delay: self.config.cancel_retry_delay(),
        }
    }

    /// Evict a terminal transfer after the configured retention window, when
    /// one is configured. By default records are kept for the process
    /// lifetime.
    fn schedule_eviction(&self, transfer_id: &TransferId) {
        let Some(retention) = self.config.terminal_retention() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let id = transfer_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            store.lock().unwrap().evict(&id);
            debug!(transfer_id = %id, "evicted terminal transfer");
        });
    }
}
