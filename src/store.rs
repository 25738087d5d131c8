//! Transfer lifecycle store
//!
//! The authoritative in-memory record of every transfer this plugin instance
//! has seen, indexed by transfer id and aliased by the escrow's ledger index.
//! The terminal outcome is set exactly once and never unset; fulfillment and
//! cancellation are mutually exclusive.
//!
//! All state is owned by one plugin instance and mutated only behind its
//! lock. Nothing here is async; callers must not hold the lock across an
//! await point.

use crate::condition::Fulfillment;
use crate::core_types::{EscrowLocator, LedgerAddress, SequenceNumber, TransferId};
use crate::errors::PluginError;
use crate::ledger::MemoWrapper;
use crate::models::Transfer;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Raw creation context cached under the escrow's ledger index so that later
/// finish/cancel events (which carry no memos of their own) can be decoded.
#[derive(Debug, Clone)]
pub struct EscrowContext {
    pub account: LedgerAddress,
    pub sequence: SequenceNumber,
    pub memos: Vec<MemoWrapper>,
}

/// Terminal outcome of a transfer. Set once, never unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Fulfilled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub transfer: Transfer,
    pub locator: EscrowLocator,
    pub ledger_index: String,
    pub outcome: Option<TransferOutcome>,
    pub fulfillment: Option<Fulfillment>,
}

impl TransferRecord {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Default)]
pub struct TransferStore {
    records: FxHashMap<TransferId, TransferRecord>,
    contexts: FxHashMap<String, EscrowContext>,
    id_by_index: FxHashMap<String, TransferId>,
    notes: FxHashMap<TransferId, serde_json::Value>,
}

impl TransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the creation context for an escrow. First write wins; the
    /// mapping is immutable once established.
    pub fn cache_context(&mut self, ledger_index: &str, context: EscrowContext) {
        self.contexts
            .entry(ledger_index.to_string())
            .or_insert(context);
    }

    pub fn context(&self, ledger_index: &str) -> Option<&EscrowContext> {
        self.contexts.get(ledger_index)
    }

    /// Remember a sender-local note before the creation validates, so the
    /// translator can attach it to the ledger-backed transfer.
    pub fn set_note(&mut self, id: &str, note: serde_json::Value) {
        self.notes.insert(id.to_string(), note);
    }

    pub fn note(&self, id: &str) -> Option<&serde_json::Value> {
        self.notes.get(id)
    }

    /// Record a validated escrow creation. Returns true when this is the
    /// first time the transfer became ledger-backed (i.e. a prepare event
    /// should be emitted); duplicate creation events are no-ops.
    pub fn record_prepared(
        &mut self,
        transfer: &Transfer,
        locator: EscrowLocator,
        ledger_index: &str,
    ) -> bool {
        match self.id_by_index.get(ledger_index) {
            Some(existing) if existing != &transfer.id => {
                warn!(
                    ledger_index,
                    existing = %existing,
                    id = %transfer.id,
                    "escrow index already mapped to a different transfer, keeping first mapping"
                );
                return false;
            }
            Some(_) => {}
            None => {
                self.id_by_index
                    .insert(ledger_index.to_string(), transfer.id.clone());
            }
        }

        if self.records.contains_key(&transfer.id) {
            return false;
        }
        self.records.insert(
            transfer.id.clone(),
            TransferRecord {
                transfer: transfer.clone(),
                locator,
                ledger_index: ledger_index.to_string(),
                outcome: None,
                fulfillment: None,
            },
        );
        true
    }

    pub fn get(&self, id: &str) -> Option<&TransferRecord> {
        self.records.get(id)
    }

    pub fn id_by_index(&self, ledger_index: &str) -> Option<&TransferId> {
        self.id_by_index.get(ledger_index)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.records.get(id).is_some_and(|r| r.is_terminal())
    }

    /// Set the terminal outcome to Fulfilled and cache the revealed
    /// fulfillment. Returns false (and changes nothing) when the transfer is
    /// already terminal - fulfillment never overwrites a cancellation and a
    /// duplicate finish event is a no-op.
    pub fn mark_fulfilled(&mut self, id: &str, fulfillment: Fulfillment) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.outcome.is_none() => {
                record.outcome = Some(TransferOutcome::Fulfilled);
                record.fulfillment = Some(fulfillment);
                true
            }
            _ => false,
        }
    }

    /// Set the terminal outcome to Cancelled. Same once-only contract as
    /// [`TransferStore::mark_fulfilled`].
    pub fn mark_cancelled(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.outcome.is_none() => {
                record.outcome = Some(TransferOutcome::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Fulfillment query with the three distinct failure kinds the caller
    /// needs to tell apart: never seen, already cancelled, still pending.
    pub fn fulfillment(&self, id: &str) -> Result<Fulfillment, PluginError> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| PluginError::TransferNotFound(id.to_string()))?;
        match record.outcome {
            Some(TransferOutcome::Cancelled) => {
                Err(PluginError::AlreadyRolledBack(id.to_string()))
            }
            Some(TransferOutcome::Fulfilled) => record
                .fulfillment
                .clone()
                .ok_or_else(|| PluginError::Internal(format!("fulfilled transfer {id} lost its fulfillment"))),
            None => Err(PluginError::MissingFulfillment(id.to_string())),
        }
    }

    /// Drop every trace of a transfer. Used by the optional terminal
    /// retention policy.
    pub fn evict(&mut self, id: &str) {
        if let Some(record) = self.records.remove(id) {
            self.contexts.remove(&record.ledger_index);
            self.id_by_index.remove(&record.ledger_index);
        }
        self.notes.remove(id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
