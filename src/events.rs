//! Caller-visible lifecycle events and ledger messages
//!
//! Every validated ledger transaction the translator understands surfaces as
//! exactly one `PluginEvent` on the broadcast channel returned by
//! `EscrowPlugin::subscribe`.

use crate::condition::Fulfillment;
use crate::core_types::Direction;
use crate::models::Transfer;
use serde::{Deserialize, Serialize};

/// A point-to-point message smuggled through a ledger payment memo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Prefixed destination account.
    pub to: String,
    /// Prefixed source account, filled in by the translator on inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Ledger prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<String>,
    /// Free-form JSON payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Caller-local request deadline override in milliseconds. Not on-wire.
    #[serde(skip)]
    pub timeout_ms: Option<u64>,
}

impl Message {
    pub fn new(to: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: None,
            to: to.into(),
            from: None,
            ledger: None,
            data,
            timeout_ms: None,
        }
    }
}

/// Lifecycle events emitted to the caller.
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// The ledger connection is up and subscribed.
    Connect,
    /// A validated escrow creation.
    Prepare {
        direction: Direction,
        transfer: Transfer,
    },
    /// A validated escrow finish, carrying the revealed fulfillment.
    Fulfill {
        direction: Direction,
        transfer: Transfer,
        fulfillment: Fulfillment,
    },
    /// A validated escrow cancellation.
    Cancel {
        direction: Direction,
        transfer: Transfer,
    },
    /// A plain ledger message (no correlation).
    Message {
        direction: Direction,
        message: Message,
    },
    /// A correlated request.
    Request {
        direction: Direction,
        message: Message,
    },
    /// A correlated response.
    Response {
        direction: Direction,
        message: Message,
    },
}

impl PluginEvent {
    /// Event name in the protocol's `<direction>_<kind>` convention.
    pub fn name(&self) -> String {
        match self {
            PluginEvent::Connect => "connect".to_string(),
            PluginEvent::Prepare { direction, .. } => format!("{direction}_prepare"),
            PluginEvent::Fulfill { direction, .. } => format!("{direction}_fulfill"),
            PluginEvent::Cancel { direction, .. } => format!("{direction}_cancel"),
            PluginEvent::Message { direction, .. } => format!("{direction}_message"),
            PluginEvent::Request { direction, .. } => format!("{direction}_request"),
            PluginEvent::Response { direction, .. } => format!("{direction}_response"),
        }
    }
}
