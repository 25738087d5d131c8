//! Transfer and ledger-info record types
//!
//! `TransferRequest` is the caller's intent; `Transfer` is the ledger-backed
//! view produced by the event translator once the corresponding transaction
//! validates. Field names serialize in the protocol's camelCase shape.

use crate::condition::Condition;
use crate::core_types::{CURRENCY_CODE, CURRENCY_SCALE, Direction, Drops, TransferId};
use crate::errors::PluginError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Caller intent to create one escrowed transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Caller-assigned id, globally unique per sender.
    pub id: TransferId,
    /// Prefixed destination, e.g. `g.crypto.ripple.rBOB`.
    pub to: String,
    /// Amount in drops.
    pub amount: Drops,
    /// Opaque ILP payload, forwarded verbatim in a memo.
    #[serde(default)]
    pub ilp: String,
    /// Hash commitment unlocking the escrow.
    pub execution_condition: Condition,
    /// Absolute expiry; the escrow becomes cancellable afterwards.
    pub expires_at: DateTime<Utc>,
    /// Sender-local annotation. Never transmitted on-ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_to_self: Option<serde_json::Value>,
}

/// A ledger-backed transfer as carried by lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: TransferId,
    pub to: String,
    pub from: String,
    pub direction: Direction,
    /// The ledger prefix this transfer rides on.
    pub ledger: String,
    /// Amount in drops, exactly as reported by the ledger.
    pub amount: Drops,
    pub ilp: String,
    pub execution_condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_to_self: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

/// Static ledger metadata reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerInfo {
    pub prefix: String,
    pub currency_code: String,
    pub currency_scale: u8,
}

impl LedgerInfo {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            currency_code: CURRENCY_CODE.to_string(),
            currency_scale: CURRENCY_SCALE,
        }
    }
}

/// Render integer drops as the XRP decimal string prepare calls expect.
pub fn drops_to_xrp(drops: Drops) -> String {
    Decimal::new(drops as i64, CURRENCY_SCALE as u32)
        .normalize()
        .to_string()
}

/// Parse an XRP decimal string back into integer drops.
pub fn xrp_to_drops(xrp: &str) -> Result<Drops, PluginError> {
    let amount = Decimal::from_str(xrp)
        .map_err(|_| PluginError::InvalidFields(format!("bad XRP amount: {xrp}")))?;
    (amount * Decimal::from(1_000_000u64))
        .round()
        .to_u64()
        .ok_or_else(|| PluginError::InvalidFields(format!("XRP amount out of range: {xrp}")))
}
