//! Submission correlation
//!
//! A submitted transaction is only settled by the validated-event stream:
//! the submission's hash is registered before the blob goes out, and the
//! matching validated event resolves it. `tesSUCCESS` resolves Ok, any other
//! validated engine result rejects with the raw result for diagnostics.
//! Events for hashes with no pending handle are ignored - they belong to a
//! different submission path or are duplicate notifications.
//!
//! There is deliberately no timeout here: a submission that never validates
//! hangs until its caller gives up. Timeout policy belongs to the caller.

use crate::errors::PluginError;
use crate::ledger::{LedgerClient, RESULT_SUCCESS, Signed, TransactionEvent};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type PendingResult = Result<(), PluginError>;

#[derive(Debug, Default)]
pub struct PendingSubmissions {
    pending: DashMap<String, oneshot::Sender<PendingResult>>,
}

impl PendingSubmissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending handle for `hash`. At most one handle per hash may
    /// be outstanding; a second concurrent submission of the same content is
    /// a caller error.
    fn register(&self, hash: &str) -> Result<oneshot::Receiver<PendingResult>, PluginError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(hash.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PluginError::DuplicateSubmission(hash.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Settle the pending handle matching this validated event, if any.
    /// Called for every validated event, before translation.
    pub fn resolve(&self, event: &TransactionEvent) {
        let hash = &event.transaction.hash;
        let Some((_, handle)) = self.pending.remove(hash) else {
            trace!(hash = %hash, "validated event matches no pending submission");
            return;
        };

        let result = if event.engine_result == RESULT_SUCCESS {
            Ok(())
        } else {
            Err(PluginError::NotAccepted {
                hash: hash.clone(),
                engine_result: event.engine_result.clone(),
            })
        };
        debug!(hash = %hash, engine_result = %event.engine_result, "settling submission");
        let _ = handle.send(result);
    }

    /// Submit a signed transaction and wait for the ledger to validate it.
    pub async fn submit_and_confirm(
        &self,
        client: &dyn LedgerClient,
        signed: &Signed,
    ) -> Result<(), PluginError> {
        let rx = self.register(&signed.id)?;

        if let Err(e) = client.submit(&signed.signed_transaction).await {
            self.pending.remove(&signed.id);
            return Err(e.into());
        }
        debug!(hash = %signed.id, "submitted transaction, awaiting validation");

        rx.await
            .map_err(|_| PluginError::Internal("submission handle dropped".into()))?
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{RawTransaction, TransactionMeta, TxType};

    fn event(hash: &str, engine_result: &str) -> TransactionEvent {
        TransactionEvent {
            validated: true,
            engine_result: engine_result.into(),
            transaction: RawTransaction {
                transaction_type: TxType::Payment,
                account: "rALICE".into(),
                destination: Some("rBOB".into()),
                amount: None,
                sequence: None,
                owner: None,
                offer_sequence: None,
                condition: None,
                fulfillment: None,
                cancel_after: None,
                memos: None,
                hash: hash.into(),
            },
            meta: TransactionMeta::default(),
        }
    }

    #[tokio::test]
    async fn test_success_resolves_pending() {
        let pending = PendingSubmissions::new();
        let rx = pending.register("AB12").unwrap();

        pending.resolve(&event("AB12", "tesSUCCESS"));
        assert!(rx.await.unwrap().is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_carries_engine_result() {
        let pending = PendingSubmissions::new();
        let rx = pending.register("AB12").unwrap();

        pending.resolve(&event("AB12", "tecNO_TARGET"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            PluginError::NotAccepted { engine_result, .. } if engine_result == "tecNO_TARGET"
        ));
    }

    #[tokio::test]
    async fn test_unknown_hash_is_ignored() {
        let pending = PendingSubmissions::new();
        let rx = pending.register("AB12").unwrap();

        pending.resolve(&event("FFFF", "tesSUCCESS"));
        assert_eq!(pending.len(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_a_caller_error() {
        let pending = PendingSubmissions::new();
        let _rx = pending.register("AB12").unwrap();
        assert!(matches!(
            pending.register("AB12"),
            Err(PluginError::DuplicateSubmission(_))
        ));
    }

    #[tokio::test]
    async fn test_settles_at_most_once() {
        let pending = PendingSubmissions::new();
        let rx = pending.register("AB12").unwrap();

        pending.resolve(&event("AB12", "tesSUCCESS"));
        // A duplicate notification for the same hash finds no handle.
        pending.resolve(&event("AB12", "tecNO_TARGET"));
        assert!(rx.await.unwrap().is_ok());
    }
}
