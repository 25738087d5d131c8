//! In-memory ledger client
//!
//! Implements the client seam entirely in memory: deterministic address
//! derivation, sequence assignment, escrow bookkeeping and instant
//! validation of every submission into realistic affected-node metadata.
//! One instance plays the ledger for any number of plugins, so two plugins
//! wired to the same mock observe each other's transactions.
//!
//! The mock enforces the escrow rules the engine depends on: a finish with a
//! preimage that does not hash to the committed condition is rejected, and a
//! cancel before the escrow's cancel-after window gets `tecNO_PERMISSION`.

use super::{
    AccountInfo, ClientError, EscrowCancellation, EscrowCreation, EscrowExecution, EscrowFields,
    LedgerClient, MemoWrapper, NodeDiff, PaymentSpec, Prepared, RawTransaction, Signed,
    TransactionEvent, TransactionMeta, TxType,
};
use crate::condition::Fulfillment;
use crate::core_types::{Drops, LedgerAddress, SequenceNumber};
use crate::ledger::AffectedNode;
use crate::models::{drops_to_xrp, xrp_to_drops};
use crate::translate::utc_to_ledger_time;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct MockAccount {
    balance_drops: Drops,
    sequence: SequenceNumber,
}

#[derive(Debug, Clone)]
struct MockEscrow {
    owner: LedgerAddress,
    destination: LedgerAddress,
    amount_drops: Drops,
    condition: Option<String>,
    cancel_after: i64,
    ledger_index: String,
}

#[derive(Debug, Default)]
struct MockState {
    accounts: HashMap<LedgerAddress, MockAccount>,
    escrows: HashMap<(LedgerAddress, SequenceNumber), MockEscrow>,
    subscribers: Vec<mpsc::UnboundedSender<TransactionEvent>>,
    forced_results: VecDeque<String>,
}

#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
    connected: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account balance.
    pub fn fund(&self, address: &str, drops: Drops) {
        let mut state = self.state.lock().unwrap();
        state.accounts.entry(address.to_string()).or_default().balance_drops = drops;
    }

    /// Force the next submission to validate with this engine result instead
    /// of being applied. Stacks in FIFO order.
    pub fn fail_next_submission(&self, engine_result: &str) {
        self.state
            .lock()
            .unwrap()
            .forced_results
            .push_back(engine_result.to_string());
    }

    /// Inject a raw event into every subscriber, bypassing submission.
    pub fn broadcast(&self, event: TransactionEvent) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn escrow_count(&self) -> usize {
        self.state.lock().unwrap().escrows.len()
    }

    fn next_sequence(state: &mut MockState, address: &str) -> SequenceNumber {
        let account = state.accounts.entry(address.to_string()).or_default();
        account.sequence += 1;
        account.sequence
    }

    fn escrow_index(owner: &str, sequence: SequenceNumber) -> String {
        hex::encode_upper(Sha256::digest(format!("escrow:{owner}:{sequence}")))
    }

    fn credit(state: &mut MockState, address: &str, drops: Drops) {
        let account = state.accounts.entry(address.to_string()).or_default();
        account.balance_drops = account.balance_drops.saturating_add(drops);
    }

    fn debit(state: &mut MockState, address: &str, drops: Drops) {
        let account = state.accounts.entry(address.to_string()).or_default();
        account.balance_drops = account.balance_drops.saturating_sub(drops);
    }

    fn deleted_escrow_meta(escrow: &MockEscrow) -> TransactionMeta {
        TransactionMeta {
            affected_nodes: vec![AffectedNode {
                deleted: Some(NodeDiff {
                    ledger_entry_type: "Escrow".to_string(),
                    ledger_index: escrow.ledger_index.clone(),
                    new_fields: None,
                    final_fields: Some(EscrowFields {
                        account: escrow.owner.clone(),
                        destination: escrow.destination.clone(),
                        amount: escrow.amount_drops.to_string(),
                        condition: escrow.condition.clone(),
                        cancel_after: Some(escrow.cancel_after),
                    }),
                }),
                ..Default::default()
            }],
        }
    }

    /// Apply a signed transaction to the mock ledger state and produce the
    /// validated outcome.
    fn apply(state: &mut MockState, tx: &RawTransaction) -> (String, TransactionMeta) {
        if let Some(forced) = state.forced_results.pop_front() {
            return (forced, TransactionMeta::default());
        }

        match tx.transaction_type {
            TxType::EscrowCreate => {
                let sequence = tx.sequence.unwrap_or_default();
                let amount_drops: Drops =
                    tx.amount.as_deref().unwrap_or("0").parse().unwrap_or_default();
                let escrow = MockEscrow {
                    owner: tx.account.clone(),
                    destination: tx.destination.clone().unwrap_or_default(),
                    amount_drops,
                    condition: tx.condition.clone(),
                    cancel_after: tx.cancel_after.unwrap_or_default(),
                    ledger_index: Self::escrow_index(&tx.account, sequence),
                };
                Self::debit(state, &tx.account, amount_drops);

                let meta = TransactionMeta {
                    affected_nodes: vec![AffectedNode {
                        created: Some(NodeDiff {
                            ledger_entry_type: "Escrow".to_string(),
                            ledger_index: escrow.ledger_index.clone(),
                            new_fields: Some(EscrowFields {
                                account: escrow.owner.clone(),
                                destination: escrow.destination.clone(),
                                amount: escrow.amount_drops.to_string(),
                                condition: escrow.condition.clone(),
                                cancel_after: Some(escrow.cancel_after),
                            }),
                            final_fields: None,
                        }),
                        ..Default::default()
                    }],
                };
                state.escrows.insert((tx.account.clone(), sequence), escrow);
                ("tesSUCCESS".to_string(), meta)
            }
            TxType::EscrowFinish => {
                let key = (
                    tx.owner.clone().unwrap_or_default(),
                    tx.offer_sequence.unwrap_or_default(),
                );
                let Some(escrow) = state.escrows.get(&key).cloned() else {
                    return ("tecNO_TARGET".to_string(), TransactionMeta::default());
                };

                if let Some(committed) = &escrow.condition {
                    let revealed = tx
                        .fulfillment
                        .as_deref()
                        .and_then(|f| Fulfillment::from_ledger(f).ok());
                    let valid = revealed
                        .is_some_and(|f| f.condition().to_ledger() == *committed);
                    if !valid {
                        return (
                            "tecCRYPTOCONDITION_ERROR".to_string(),
                            TransactionMeta::default(),
                        );
                    }
                }

                state.escrows.remove(&key);
                Self::credit(state, &escrow.destination, escrow.amount_drops);
                ("tesSUCCESS".to_string(), Self::deleted_escrow_meta(&escrow))
            }
            TxType::EscrowCancel => {
                let key = (
                    tx.owner.clone().unwrap_or_default(),
                    tx.offer_sequence.unwrap_or_default(),
                );
                let Some(escrow) = state.escrows.get(&key).cloned() else {
                    return ("tecNO_TARGET".to_string(), TransactionMeta::default());
                };
                if utc_to_ledger_time(&Utc::now()) < escrow.cancel_after {
                    return ("tecNO_PERMISSION".to_string(), TransactionMeta::default());
                }

                state.escrows.remove(&key);
                Self::credit(state, &escrow.owner, escrow.amount_drops);
                ("tesSUCCESS".to_string(), Self::deleted_escrow_meta(&escrow))
            }
            TxType::Payment => {
                let drops: Drops =
                    tx.amount.as_deref().unwrap_or("0").parse().unwrap_or_default();
                Self::debit(state, &tx.account, drops);
                if let Some(destination) = &tx.destination {
                    Self::credit(state, destination, drops);
                }
                ("tesSUCCESS".to_string(), TransactionMeta::default())
            }
            TxType::Other => ("tesSUCCESS".to_string(), TransactionMeta::default()),
        }
    }
}

#[async_trait::async_trait]
impl LedgerClient for MockLedger {
    async fn connect(&self) -> Result<(), ClientError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn derive_address(&self, secret: &str) -> Result<LedgerAddress, ClientError> {
        if secret.is_empty() {
            return Err(ClientError::InvalidSecret);
        }
        let digest = Sha256::digest(secret.as_bytes());
        Ok(format!("r{}", hex::encode_upper(&digest[..16])))
    }

    async fn get_account_info(&self, address: &str) -> Result<AccountInfo, ClientError> {
        let state = self.state.lock().unwrap();
        let account = state
            .accounts
            .get(address)
            .ok_or_else(|| ClientError::AccountNotFound(address.to_string()))?;
        Ok(AccountInfo {
            xrp_balance: drops_to_xrp(account.balance_drops),
            sequence: account.sequence,
        })
    }

    async fn prepare_escrow_creation(
        &self,
        address: &str,
        params: EscrowCreation,
    ) -> Result<Prepared, ClientError> {
        let drops = xrp_to_drops(&params.amount)
            .map_err(|e| ClientError::Prepare(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        let sequence = Self::next_sequence(&mut state, address);

        let tx = RawTransaction {
            transaction_type: TxType::EscrowCreate,
            account: address.to_string(),
            destination: Some(params.destination),
            amount: Some(drops.to_string()),
            sequence: Some(sequence),
            owner: None,
            offer_sequence: None,
            condition: Some(params.condition),
            fulfillment: None,
            cancel_after: Some(utc_to_ledger_time(&params.allow_cancel_after)),
            memos: Some(
                params
                    .memos
                    .iter()
                    .map(|m| MemoWrapper::from_plain(&m.memo_type, &m.data))
                    .collect(),
            ),
            hash: String::new(),
        };
        Ok(Prepared {
            tx_json: serde_json::to_string(&tx)
                .map_err(|e| ClientError::Prepare(e.to_string()))?,
        })
    }

    async fn prepare_escrow_execution(
        &self,
        address: &str,
        params: EscrowExecution,
    ) -> Result<Prepared, ClientError> {
        let mut state = self.state.lock().unwrap();
        let sequence = Self::next_sequence(&mut state, address);

        let tx = RawTransaction {
            transaction_type: TxType::EscrowFinish,
            account: address.to_string(),
            destination: None,
            amount: None,
            sequence: Some(sequence),
            owner: Some(params.owner),
            offer_sequence: Some(params.escrow_sequence),
            condition: Some(params.condition),
            fulfillment: Some(params.fulfillment),
            cancel_after: None,
            memos: Some(
                params
                    .memos
                    .iter()
                    .map(|m| MemoWrapper::from_plain(&m.memo_type, &m.data))
                    .collect(),
            ),
            hash: String::new(),
        };
        Ok(Prepared {
            tx_json: serde_json::to_string(&tx)
                .map_err(|e| ClientError::Prepare(e.to_string()))?,
        })
    }

    async fn prepare_escrow_cancellation(
        &self,
        address: &str,
        params: EscrowCancellation,
    ) -> Result<Prepared, ClientError> {
        let mut state = self.state.lock().unwrap();
        let sequence = Self::next_sequence(&mut state, address);

        let tx = RawTransaction {
            transaction_type: TxType::EscrowCancel,
            account: address.to_string(),
            destination: None,
            amount: None,
            sequence: Some(sequence),
            owner: Some(params.owner),
            offer_sequence: Some(params.escrow_sequence),
            condition: None,
            fulfillment: None,
            cancel_after: None,
            memos: None,
            hash: String::new(),
        };
        Ok(Prepared {
            tx_json: serde_json::to_string(&tx)
                .map_err(|e| ClientError::Prepare(e.to_string()))?,
        })
    }

    async fn prepare_payment(
        &self,
        address: &str,
        params: PaymentSpec,
    ) -> Result<Prepared, ClientError> {
        let drops = xrp_to_drops(&params.amount)
            .map_err(|e| ClientError::Prepare(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        let sequence = Self::next_sequence(&mut state, address);

        let tx = RawTransaction {
            transaction_type: TxType::Payment,
            account: address.to_string(),
            destination: Some(params.destination),
            amount: Some(drops.to_string()),
            sequence: Some(sequence),
            owner: None,
            offer_sequence: None,
            condition: None,
            fulfillment: None,
            cancel_after: None,
            memos: Some(
                params
                    .memos
                    .iter()
                    .map(|m| MemoWrapper::from_plain(&m.memo_type, &m.data))
                    .collect(),
            ),
            hash: String::new(),
        };
        Ok(Prepared {
            tx_json: serde_json::to_string(&tx)
                .map_err(|e| ClientError::Prepare(e.to_string()))?,
        })
    }

    fn sign(&self, tx_json: &str, secret: &str) -> Result<Signed, ClientError> {
        if secret.is_empty() {
            return Err(ClientError::InvalidSecret);
        }
        let mut tx: RawTransaction =
            serde_json::from_str(tx_json).map_err(|e| ClientError::Sign(e.to_string()))?;
        tx.hash = hex::encode_upper(Sha256::digest(tx_json.as_bytes()));
        Ok(Signed {
            id: tx.hash.clone(),
            signed_transaction: serde_json::to_string(&tx)
                .map_err(|e| ClientError::Sign(e.to_string()))?,
        })
    }

    async fn submit(&self, signed_transaction: &str) -> Result<(), ClientError> {
        let tx: RawTransaction = serde_json::from_str(signed_transaction)
            .map_err(|e| ClientError::Submit(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        let (engine_result, meta) = Self::apply(&mut state, &tx);
        debug!(hash = %tx.hash, %engine_result, "mock ledger validated transaction");

        let event = TransactionEvent {
            validated: true,
            engine_result,
            transaction: tx,
            meta,
        };
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        _address: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransactionEvent>, ClientError> {
        // The mock broadcasts every validated transaction to every
        // subscriber; plugins filter by direction themselves.
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        Ok(rx)
    }
}
