//! Plugin error taxonomy
//!
//! Construction-time misconfiguration fails fast; per-transfer operational
//! errors are returned to the caller awaiting that transfer and never take
//! down the engine; translation errors are logged and the offending event
//! dropped without touching the ledger subscription.

use crate::core_types::TransferId;
use crate::ledger::ClientError;
use crate::translate::TranslateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    // === Construction / caller input ===
    #[error("invalid fields: {0}")]
    InvalidFields(String),

    // === Transfer queries ===
    #[error("transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("transfer {0} has not yielded a fulfillment yet")]
    MissingFulfillment(TransferId),

    #[error("transfer {0} was already rolled back")]
    AlreadyRolledBack(TransferId),

    // === Ledger submission ===
    #[error("transaction {hash} not accepted by ledger: {engine_result}")]
    NotAccepted { hash: String, engine_result: String },

    #[error("transaction {0} already has a submission in flight")]
    DuplicateSubmission(String),

    // === Messaging ===
    #[error("request {0} timed out")]
    RequestTimedOut(String),

    // === System ===
    #[error("plugin is not connected")]
    NotConnected,

    #[error("translation failed: {0}")]
    Translate(#[from] TranslateError),

    #[error("ledger client error: {0}")]
    Ledger(#[from] ClientError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PluginError {
    fn from(e: anyhow::Error) -> Self {
        PluginError::Internal(e.to_string())
    }
}

impl PluginError {
    /// Machine-readable error code, stable across message changes.
    pub fn code(&self) -> &'static str {
        match self {
            PluginError::InvalidFields(_) => "INVALID_FIELDS",
            PluginError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            PluginError::MissingFulfillment(_) => "MISSING_FULFILLMENT",
            PluginError::AlreadyRolledBack(_) => "ALREADY_ROLLED_BACK",
            PluginError::NotAccepted { .. } => "NOT_ACCEPTED",
            PluginError::DuplicateSubmission(_) => "DUPLICATE_SUBMISSION",
            PluginError::RequestTimedOut(_) => "REQUEST_TIMED_OUT",
            PluginError::NotConnected => "NOT_CONNECTED",
            PluginError::Translate(_) => "TRANSLATE_ERROR",
            PluginError::Ledger(_) => "LEDGER_ERROR",
            PluginError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PluginError::TransferNotFound("t1".into()).code(),
            "TRANSFER_NOT_FOUND"
        );
        assert_eq!(
            PluginError::NotAccepted {
                hash: "AB".into(),
                engine_result: "tecNO_TARGET".into()
            }
            .code(),
            "NOT_ACCEPTED"
        );
        assert_eq!(PluginError::NotConnected.code(), "NOT_CONNECTED");
    }

    #[test]
    fn test_display_carries_engine_result() {
        let err = PluginError::NotAccepted {
            hash: "CAFE".into(),
            engine_result: "tecNO_PERMISSION".into(),
        };
        let text = err.to_string();
        assert!(text.contains("CAFE"));
        assert!(text.contains("tecNO_PERMISSION"));
    }
}
