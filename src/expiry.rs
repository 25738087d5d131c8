//! Expiry scheduler
//!
//! One detached timer per ledger-backed transfer. After `expires_at` plus the
//! configured grace buffer the timer submits an EscrowCancel for the escrow's
//! locator - unless the transfer already reached a terminal outcome, in which
//! case the timer is a no-op (fulfillment always wins and is never undone).
//!
//! The escrow's cancel-after window runs on ledger consensus time, so a
//! cancellation submitted exactly at local expiry can be rejected as
//! premature. Those rejections, and the ledger's retry class, are retried
//! under the configured policy; anything else is surfaced via logging only
//! and the transfer left non-terminal.

use crate::config::RetryPolicy;
use crate::core_types::{EscrowLocator, TransferId};
use crate::errors::PluginError;
use crate::ledger::{
    EngineResultClass, EscrowCancellation, LedgerClient, classify_engine_result,
};
use crate::store::TransferStore;
use crate::submit::PendingSubmissions;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Whether a rejected cancellation is worth retrying: the ledger's own retry
/// class, plus the no-permission result a cancel gets when it lands before
/// the escrow's cancel-after has passed on ledger time.
pub fn is_transient_cancel_result(engine_result: &str) -> bool {
    classify_engine_result(engine_result) == EngineResultClass::Retry
        || engine_result == "tecNO_PERMISSION"
}

/// Delay until the cancellation should fire: time to expiry plus grace,
/// clamped at zero for already-expired transfers.
pub fn cancel_delay(expires_at: &DateTime<Utc>, grace: Duration, now: DateTime<Utc>) -> Duration {
    let until_expiry = expires_at.signed_duration_since(now).num_milliseconds();
    let total = until_expiry.saturating_add(grace.as_millis() as i64);
    if total <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(total as u64)
    }
}

/// Everything the detached watcher task needs to cancel on its own.
#[derive(Clone)]
pub(crate) struct ExpiryContext {
    pub store: Arc<Mutex<TransferStore>>,
    pub client: Arc<dyn LedgerClient>,
    pub pending: Arc<PendingSubmissions>,
    pub address: String,
    pub secret: String,
    pub grace: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: Duration,
}

/// Sleep until the transfer's cancellation window, then drive the
/// cancellation to submission, retrying transient rejections.
pub(crate) async fn watch_expiry(ctx: ExpiryContext, id: TransferId, expires_at: DateTime<Utc>) {
    tokio::time::sleep(cancel_delay(&expires_at, ctx.grace, Utc::now())).await;

    let locator = {
        let store = ctx.store.lock().unwrap();
        match store.get(&id) {
            None => return,
            Some(record) if record.is_terminal() => {
                debug!(transfer_id = %id, "expiry timer fired on terminal transfer, nothing to do");
                return;
            }
            Some(record) => record.locator.clone(),
        }
    };

    debug!(transfer_id = %id, locator = %locator, "transfer expired, cancelling escrow");

    let mut failures = 0u32;
    loop {
        match try_cancel(&ctx, &locator).await {
            Ok(()) => {
                // The cancel event arrives through the validated stream and
                // settles the transfer there.
                debug!(transfer_id = %id, "cancellation validated");
                return;
            }
            Err(PluginError::NotAccepted { engine_result, .. })
                if is_transient_cancel_result(&engine_result) =>
            {
                failures += 1;
                if !ctx.retry.allows_retry(failures) {
                    warn!(
                        transfer_id = %id,
                        engine_result = %engine_result,
                        failures,
                        "cancellation retries exhausted, leaving transfer open"
                    );
                    return;
                }
                debug!(transfer_id = %id, engine_result = %engine_result, failures, "retrying cancellation");
                if !ctx.retry_delay.is_zero() {
                    tokio::time::sleep(ctx.retry_delay).await;
                }
                if ctx.store.lock().unwrap().is_terminal(&id) {
                    debug!(transfer_id = %id, "transfer settled while retrying, stopping");
                    return;
                }
            }
            Err(e) => {
                if ctx.store.lock().unwrap().is_terminal(&id) {
                    // Someone settled the escrow first; the ledger rejecting
                    // our cancel is the expected outcome.
                    debug!(transfer_id = %id, "cancellation lost the race, escrow already settled");
                } else {
                    error!(
                        transfer_id = %id,
                        error = %e,
                        "cancellation rejected, leaving transfer non-terminal"
                    );
                }
                return;
            }
        }
    }
}

async fn try_cancel(ctx: &ExpiryContext, locator: &EscrowLocator) -> Result<(), PluginError> {
    let prepared = ctx
        .client
        .prepare_escrow_cancellation(
            &ctx.address,
            EscrowCancellation {
                owner: locator.owner.clone(),
                escrow_sequence: locator.sequence,
            },
        )
        .await?;
    let signed = ctx.client.sign(&prepared.tx_json, &ctx.secret)?;
    ctx.pending
        .submit_and_confirm(ctx.client.as_ref(), &signed)
        .await
}
