//! Ledger client seam
//!
//! The plugin consumes the ledger through this trait. The wrapped client owns
//! the hard parts (websocket transport, canonical signing, fee handling); the
//! plugin only depends on the contract below: prepare/sign/submit plus a
//! stream of validated-transaction events for the subscribed account.
//!
//! Wire types mirror the ledger's JSON shapes so a real client can pass
//! payloads through untouched.

use crate::core_types::{LedgerAddress, SequenceNumber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "mock-ledger")]
pub mod mock;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("invalid secret")]
    InvalidSecret,

    #[error("prepare failed: {0}")]
    Prepare(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("submit failed: {0}")]
    Submit(String),

    #[error("malformed payload: {0}")]
    Payload(String),
}

// ============================================================
// ENGINE RESULTS
// ============================================================

/// The engine result reported for a fully accepted transaction.
pub const RESULT_SUCCESS: &str = "tesSUCCESS";

/// Result classes of the ledger's transaction engine, decoded once from the
/// three-letter code prefix so downstream policy never string-matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineResultClass {
    /// `tes` - applied and successful.
    Success,
    /// `tec` - claimed a fee but did not achieve its intent.
    Claimed,
    /// `tef` - cannot succeed against the current ledger state.
    Failure,
    /// `tel` - local node error.
    Local,
    /// `tem` - malformed transaction.
    Malformed,
    /// `ter` - could succeed later; worth retrying.
    Retry,
    /// Anything this build does not recognize.
    Unknown,
}

pub fn classify_engine_result(code: &str) -> EngineResultClass {
    match code.get(..3) {
        Some("tes") => EngineResultClass::Success,
        Some("tec") => EngineResultClass::Claimed,
        Some("tef") => EngineResultClass::Failure,
        Some("tel") => EngineResultClass::Local,
        Some("tem") => EngineResultClass::Malformed,
        Some("ter") => EngineResultClass::Retry,
        _ => EngineResultClass::Unknown,
    }
}

// ============================================================
// WIRE TYPES (ledger JSON shapes)
// ============================================================

/// Closed set of transaction types the translator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    EscrowCreate,
    EscrowFinish,
    EscrowCancel,
    Payment,
    #[serde(other)]
    Other,
}

/// One memo as it appears on the wire: `{"Memo": {"MemoType": .., "MemoData": ..}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoWrapper {
    #[serde(rename = "Memo")]
    pub memo: MemoFields,
}

/// Hex-encoded memo contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoFields {
    #[serde(rename = "MemoType")]
    pub memo_type: String,
    #[serde(rename = "MemoData")]
    pub memo_data: String,
}

impl MemoWrapper {
    /// Build a wire memo from plain UTF-8 type and data.
    pub fn from_plain(memo_type: &str, data: &[u8]) -> Self {
        Self {
            memo: MemoFields {
                memo_type: hex::encode_upper(memo_type.as_bytes()),
                memo_data: hex::encode_upper(data),
            },
        }
    }

    /// Decode back to plain UTF-8 type and raw data bytes.
    pub fn to_plain(&self) -> Result<(String, Vec<u8>), hex::FromHexError> {
        let memo_type = hex::decode(&self.memo.memo_type)?;
        let data = hex::decode(&self.memo.memo_data)?;
        Ok((String::from_utf8_lossy(&memo_type).into_owned(), data))
    }
}

/// The raw transaction inside a subscription event. Optional fields only
/// appear for the transaction types that carry them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(rename = "TransactionType")]
    pub transaction_type: TxType,

    #[serde(rename = "Account")]
    pub account: LedgerAddress,

    #[serde(rename = "Destination", default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<LedgerAddress>,

    /// Amount in drops (the ledger serializes native amounts as strings).
    #[serde(rename = "Amount", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,

    #[serde(rename = "Sequence", default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceNumber>,

    /// EscrowFinish/EscrowCancel: the escrow's owning account.
    #[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<LedgerAddress>,

    /// EscrowFinish/EscrowCancel: the creation sequence of the escrow.
    #[serde(rename = "OfferSequence", default, skip_serializing_if = "Option::is_none")]
    pub offer_sequence: Option<SequenceNumber>,

    /// Upper-hex crypto-condition (EscrowCreate/EscrowFinish).
    #[serde(rename = "Condition", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Upper-hex fulfillment revealed by an EscrowFinish.
    #[serde(rename = "Fulfillment", default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<String>,

    /// Expiry in ledger epoch seconds (EscrowCreate).
    #[serde(rename = "CancelAfter", default, skip_serializing_if = "Option::is_none")]
    pub cancel_after: Option<i64>,

    #[serde(rename = "Memos", default, skip_serializing_if = "Option::is_none")]
    pub memos: Option<Vec<MemoWrapper>>,

    /// Transaction hash, present once signed.
    #[serde(default)]
    pub hash: String,
}

/// Ledger-state delta for one node touched by a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AffectedNode {
    #[serde(rename = "CreatedNode", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<NodeDiff>,

    #[serde(rename = "DeletedNode", default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<NodeDiff>,

    #[serde(rename = "ModifiedNode", default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<NodeDiff>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDiff {
    #[serde(rename = "LedgerEntryType")]
    pub ledger_entry_type: String,

    /// Unique index of the ledger object, stable across create and delete.
    #[serde(rename = "LedgerIndex")]
    pub ledger_index: String,

    #[serde(rename = "NewFields", default, skip_serializing_if = "Option::is_none")]
    pub new_fields: Option<EscrowFields>,

    #[serde(rename = "FinalFields", default, skip_serializing_if = "Option::is_none")]
    pub final_fields: Option<EscrowFields>,
}

impl NodeDiff {
    /// The node's resulting field-set: `NewFields` on creation, `FinalFields`
    /// on deletion.
    pub fn fields(&self) -> Option<&EscrowFields> {
        self.new_fields.as_ref().or(self.final_fields.as_ref())
    }
}

/// Field-set of an Escrow ledger object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowFields {
    #[serde(rename = "Account")]
    pub account: LedgerAddress,

    #[serde(rename = "Destination")]
    pub destination: LedgerAddress,

    /// Escrowed amount in drops.
    #[serde(rename = "Amount")]
    pub amount: String,

    #[serde(rename = "Condition", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(rename = "CancelAfter", default, skip_serializing_if = "Option::is_none")]
    pub cancel_after: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(rename = "AffectedNodes", default)]
    pub affected_nodes: Vec<AffectedNode>,
}

/// One notification from the validated-transaction subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Whether the transaction reached irreversible consensus.
    pub validated: bool,

    pub engine_result: String,

    pub transaction: RawTransaction,

    #[serde(default)]
    pub meta: TransactionMeta,
}

// ============================================================
// PREPARE PARAMETERS
// ============================================================

/// Plain UTF-8 memo handed to a prepare call; the client hex-encodes it.
#[derive(Debug, Clone)]
pub struct MemoSpec {
    pub memo_type: String,
    pub data: Vec<u8>,
}

impl MemoSpec {
    pub fn new(memo_type: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            memo_type: memo_type.to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscrowCreation {
    /// XRP decimal string, e.g. `"1.5"`.
    pub amount: String,
    pub destination: LedgerAddress,
    /// Upper-hex crypto-condition.
    pub condition: String,
    pub allow_cancel_after: DateTime<Utc>,
    pub memos: Vec<MemoSpec>,
}

#[derive(Debug, Clone)]
pub struct EscrowExecution {
    pub owner: LedgerAddress,
    pub escrow_sequence: SequenceNumber,
    pub condition: String,
    pub fulfillment: String,
    pub memos: Vec<MemoSpec>,
}

#[derive(Debug, Clone)]
pub struct EscrowCancellation {
    pub owner: LedgerAddress,
    pub escrow_sequence: SequenceNumber,
}

#[derive(Debug, Clone)]
pub struct PaymentSpec {
    pub destination: LedgerAddress,
    /// XRP decimal string. Messages ride the minimum transferable amount.
    pub amount: String,
    pub memos: Vec<MemoSpec>,
}

/// An unsigned transaction as produced by a prepare call.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub tx_json: String,
}

/// A signed transaction blob plus its hash.
#[derive(Debug, Clone)]
pub struct Signed {
    /// Transaction hash; the key the validated-event stream is matched on.
    pub id: String,
    pub signed_transaction: String,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    /// Balance as an XRP decimal string.
    pub xrp_balance: String,
    pub sequence: SequenceNumber,
}

// ============================================================
// CLIENT TRAIT
// ============================================================

#[async_trait]
pub trait LedgerClient: Send + Sync + Debug {
    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Derive the ledger address controlled by `secret`.
    fn derive_address(&self, secret: &str) -> Result<LedgerAddress, ClientError>;

    async fn get_account_info(&self, address: &str) -> Result<AccountInfo, ClientError>;

    async fn prepare_escrow_creation(
        &self,
        address: &str,
        params: EscrowCreation,
    ) -> Result<Prepared, ClientError>;

    async fn prepare_escrow_execution(
        &self,
        address: &str,
        params: EscrowExecution,
    ) -> Result<Prepared, ClientError>;

    async fn prepare_escrow_cancellation(
        &self,
        address: &str,
        params: EscrowCancellation,
    ) -> Result<Prepared, ClientError>;

    async fn prepare_payment(
        &self,
        address: &str,
        params: PaymentSpec,
    ) -> Result<Prepared, ClientError>;

    fn sign(&self, tx_json: &str, secret: &str) -> Result<Signed, ClientError>;

    async fn submit(&self, signed_transaction: &str) -> Result<(), ClientError>;

    /// Subscribe to validated-transaction events involving `address`.
    ///
    /// Events arrive in ledger order; the receiver must drain them promptly.
    async fn subscribe(
        &self,
        address: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransactionEvent>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_engine_result() {
        assert_eq!(
            classify_engine_result("tesSUCCESS"),
            EngineResultClass::Success
        );
        assert_eq!(
            classify_engine_result("tecNO_PERMISSION"),
            EngineResultClass::Claimed
        );
        assert_eq!(
            classify_engine_result("terPRE_SEQ"),
            EngineResultClass::Retry
        );
        assert_eq!(
            classify_engine_result("temBAD_FEE"),
            EngineResultClass::Malformed
        );
        assert_eq!(classify_engine_result("??"), EngineResultClass::Unknown);
    }

    #[test]
    fn test_memo_round_trip() {
        let memo = MemoWrapper::from_plain("https://interledger.org/rel/xrpId", b"t1");
        let (memo_type, data) = memo.to_plain().unwrap();
        assert_eq!(memo_type, "https://interledger.org/rel/xrpId");
        assert_eq!(data, b"t1");
    }

    #[test]
    fn test_tx_type_closed_set() {
        let tx: TxType = serde_json::from_str("\"EscrowCreate\"").unwrap();
        assert_eq!(tx, TxType::EscrowCreate);
        // Unknown types collapse into Other instead of failing the event.
        let tx: TxType = serde_json::from_str("\"NFTokenMint\"").unwrap();
        assert_eq!(tx, TxType::Other);
    }

    #[test]
    fn test_event_deserializes_ledger_shape() {
        let raw = serde_json::json!({
            "validated": true,
            "engine_result": "tesSUCCESS",
            "transaction": {
                "TransactionType": "EscrowCreate",
                "Account": "rALICE",
                "Destination": "rBOB",
                "Amount": "1000000",
                "Sequence": 1,
                "CancelAfter": 546_000_000,
                "hash": "AB12"
            },
            "meta": {
                "AffectedNodes": [{
                    "CreatedNode": {
                        "LedgerEntryType": "Escrow",
                        "LedgerIndex": "C0FFEE",
                        "NewFields": {
                            "Account": "rALICE",
                            "Destination": "rBOB",
                            "Amount": "1000000",
                            "CancelAfter": 546_000_000
                        }
                    }
                }]
            }
        });

        let event: TransactionEvent = serde_json::from_value(raw).unwrap();
        assert!(event.validated);
        assert_eq!(event.transaction.transaction_type, TxType::EscrowCreate);
        assert_eq!(event.transaction.sequence, Some(1));

        let node = event.meta.affected_nodes[0].created.as_ref().unwrap();
        assert_eq!(node.ledger_entry_type, "Escrow");
        assert_eq!(node.fields().unwrap().amount, "1000000");
    }
}
