//! Ledger-event translation
//!
//! Turns one validated ledger transaction (plus its affected-nodes metadata)
//! into a protocol-level transfer or message. Stateless except for the
//! creation-context cache kept in the [`TransferStore`]: finish and cancel
//! transactions carry no memos of their own, so the transfer id and payload
//! must be recovered from the cached creation transaction.

use crate::condition::{Condition, ConditionError, Fulfillment};
use crate::core_types::{Direction, EscrowLocator, LedgerAddress};
use crate::events::Message;
use crate::ledger::{EscrowFields, MemoWrapper, TransactionEvent, TxType};
use crate::models::Transfer;
use crate::store::{EscrowContext, TransferStore};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use thiserror::Error;

// Memo relation URIs carrying protocol fields across the ledger.
pub const ID_REL: &str = "https://interledger.org/rel/xrpId";
pub const ILP_REL: &str = "https://interledger.org/rel/xrpIlp";
pub const MESSAGE_REL: &str = "https://interledger.org/rel/xrpMessage";
pub const MESSAGE_ID_REL: &str = "https://interledger.org/rel/xrpMessageId";
pub const FULFILLMENT_REL: &str = "https://interledger.org/rel/xrpFulfillment";

/// Seconds between the Unix epoch and the ledger's epoch (2000-01-01).
pub const LEDGER_EPOCH_OFFSET: i64 = 0x386D4380;

pub fn ledger_time_to_utc(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds + LEDGER_EPOCH_OFFSET, 0).unwrap_or_default()
}

pub fn utc_to_ledger_time(at: &DateTime<Utc>) -> i64 {
    at.timestamp() - LEDGER_EPOCH_OFFSET
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("transaction involves neither our account nor our destination")]
    ForeignTransaction,

    #[error("no escrow node in transaction metadata")]
    NoEscrowNode,

    #[error("missing memo {0} on creation event")]
    MissingMemo(&'static str),

    #[error("no cached creation context for escrow {0}")]
    UnknownEscrow(String),

    #[error("bad memo encoding: {0}")]
    MemoEncoding(String),

    #[error("bad condition: {0}")]
    Condition(#[from] ConditionError),

    #[error("missing or malformed field: {0}")]
    Field(&'static str),
}

/// A translated escrow event: the protocol transfer plus the ledger-native
/// keys it is filed under.
#[derive(Debug, Clone)]
pub struct TranslatedEscrow {
    pub transfer: Transfer,
    pub locator: EscrowLocator,
    pub ledger_index: String,
}

/// Scan the affected nodes for the Escrow ledger object, preferring the
/// deletion record (finish/cancel) and falling back to the creation record.
fn parse_escrow(event: &TransactionEvent) -> Option<(&EscrowFields, &str)> {
    let nodes = &event.meta.affected_nodes;
    nodes
        .iter()
        .filter_map(|n| n.deleted.as_ref())
        .chain(nodes.iter().filter_map(|n| n.created.as_ref()))
        .find(|diff| diff.ledger_entry_type == "Escrow")
        .and_then(|diff| Some((diff.fields()?, diff.ledger_index.as_str())))
}

/// Decode raw wire memos into a map from relation URI to data bytes.
pub fn parse_memos(memos: &[MemoWrapper]) -> Result<FxHashMap<String, Vec<u8>>, TranslateError> {
    let mut decoded = FxHashMap::default();
    for wrapper in memos {
        let (memo_type, data) = wrapper
            .to_plain()
            .map_err(|e| TranslateError::MemoEncoding(e.to_string()))?;
        decoded.insert(memo_type, data);
    }
    Ok(decoded)
}

fn memo_utf8(data: &[u8]) -> Result<String, TranslateError> {
    String::from_utf8(data.to_vec()).map_err(|e| TranslateError::MemoEncoding(e.to_string()))
}

/// Pull the revealed preimage out of an EscrowFinish: the native field when
/// present, the reveal memo otherwise.
pub fn finish_fulfillment(event: &TransactionEvent) -> Result<Fulfillment, TranslateError> {
    if let Some(ledger_hex) = &event.transaction.fulfillment {
        return Ok(Fulfillment::from_ledger(ledger_hex)?);
    }
    let memos = parse_memos(event.transaction.memos.as_deref().unwrap_or(&[]))?;
    if let Some(raw) = memos.get(FULFILLMENT_REL) {
        return Ok(Fulfillment::from_protocol(&memo_utf8(raw)?)?);
    }
    Err(TranslateError::Field("Fulfillment"))
}

#[derive(Debug, Clone)]
pub struct Translator {
    pub address: LedgerAddress,
    pub prefix: String,
}

impl Translator {
    pub fn new(address: impl Into<LedgerAddress>, prefix: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            prefix: prefix.into(),
        }
    }

    /// Outgoing when the owning account is ours, incoming when the
    /// destination is; anything else does not belong to this plugin.
    fn direction(
        &self,
        account: &str,
        destination: Option<&str>,
    ) -> Result<Direction, TranslateError> {
        if account == self.address {
            Ok(Direction::Outgoing)
        } else if destination == Some(self.address.as_str()) {
            Ok(Direction::Incoming)
        } else {
            Err(TranslateError::ForeignTransaction)
        }
    }

    fn prefixed(&self, address: &str) -> String {
        format!("{}{}", self.prefix, address)
    }

    /// Translate a validated escrow create/finish/cancel event into a
    /// protocol transfer, caching and reusing the creation context.
    pub fn escrow_to_transfer(
        &self,
        store: &mut TransferStore,
        event: &TransactionEvent,
    ) -> Result<TranslatedEscrow, TranslateError> {
        let (fields, ledger_index) =
            parse_escrow(event).ok_or(TranslateError::NoEscrowNode)?;
        let transaction = &event.transaction;

        // Memos only travel on the creation transaction; that is the one
        // moment the (account, sequence) locator is available too.
        if transaction.transaction_type == TxType::EscrowCreate
            && let Some(memos) = &transaction.memos
        {
            store.cache_context(
                ledger_index,
                EscrowContext {
                    account: transaction.account.clone(),
                    sequence: transaction
                        .sequence
                        .ok_or(TranslateError::Field("Sequence"))?,
                    memos: memos.clone(),
                },
            );
        }

        let context = store
            .context(ledger_index)
            .ok_or_else(|| TranslateError::UnknownEscrow(ledger_index.to_string()))?;
        let locator = EscrowLocator {
            owner: context.account.clone(),
            sequence: context.sequence,
        };

        let memos = parse_memos(&context.memos)?;
        let id = memo_utf8(memos.get(ID_REL).ok_or(TranslateError::MissingMemo(ID_REL))?)?;
        let ilp = memo_utf8(
            memos
                .get(ILP_REL)
                .ok_or(TranslateError::MissingMemo(ILP_REL))?,
        )?;

        let direction = self.direction(&fields.account, Some(&fields.destination))?;
        let condition = Condition::from_ledger(
            fields
                .condition
                .as_deref()
                .ok_or(TranslateError::Field("Condition"))?,
        )?;
        let expires_at = ledger_time_to_utc(
            fields
                .cancel_after
                .ok_or(TranslateError::Field("CancelAfter"))?,
        );
        let amount = fields
            .amount
            .parse()
            .map_err(|_| TranslateError::Field("Amount"))?;

        let transfer = Transfer {
            to: self.prefixed(&fields.destination),
            from: self.prefixed(&fields.account),
            direction,
            ledger: self.prefix.clone(),
            amount,
            ilp,
            execution_condition: condition,
            note_to_self: store.note(&id).cloned(),
            expires_at,
            id,
        };

        Ok(TranslatedEscrow {
            transfer,
            locator,
            ledger_index: ledger_index.to_string(),
        })
    }

    /// Translate a validated payment event into a message: payload from the
    /// message memo (empty object when absent), correlation id from the id
    /// memo (generated when absent).
    pub fn payment_to_message(
        &self,
        event: &TransactionEvent,
    ) -> Result<(Message, Direction), TranslateError> {
        let transaction = &event.transaction;
        let direction =
            self.direction(&transaction.account, transaction.destination.as_deref())?;
        let destination = transaction
            .destination
            .as_deref()
            .ok_or(TranslateError::Field("Destination"))?;

        let memos = parse_memos(transaction.memos.as_deref().unwrap_or(&[]))?;
        let data = match memos.get(MESSAGE_REL) {
            Some(raw) => serde_json::from_slice(raw)
                .map_err(|e| TranslateError::MemoEncoding(e.to_string()))?,
            None => serde_json::json!({}),
        };
        let id = match memos.get(MESSAGE_ID_REL) {
            Some(raw) => memo_utf8(raw)?,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let message = Message {
            id: Some(id),
            to: self.prefixed(destination),
            from: Some(self.prefixed(&transaction.account)),
            ledger: Some(self.prefix.clone()),
            data,
            timeout_ms: None,
        };
        Ok((message, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Fulfillment;
    use crate::ledger::{AffectedNode, NodeDiff, RawTransaction, TransactionMeta};

    const ALICE: &str = "rALICE";
    const BOB: &str = "rBOB";
    const PREFIX: &str = "g.crypto.ripple.";
    const INDEX: &str = "E3B0C44298FC1C149AFBF4C8996FB924";

    fn condition_hex() -> String {
        Fulfillment::new(b"secret".to_vec()).condition().to_ledger()
    }

    fn escrow_fields(cancel_after: i64) -> EscrowFields {
        EscrowFields {
            account: ALICE.into(),
            destination: BOB.into(),
            amount: "1000000".into(),
            condition: Some(condition_hex()),
            cancel_after: Some(cancel_after),
        }
    }

    fn create_event() -> TransactionEvent {
        TransactionEvent {
            validated: true,
            engine_result: "tesSUCCESS".into(),
            transaction: RawTransaction {
                transaction_type: TxType::EscrowCreate,
                account: ALICE.into(),
                destination: Some(BOB.into()),
                amount: Some("1000000".into()),
                sequence: Some(7),
                owner: None,
                offer_sequence: None,
                condition: Some(condition_hex()),
                fulfillment: None,
                cancel_after: Some(1_000),
                memos: Some(vec![
                    MemoWrapper::from_plain(ID_REL, b"t1"),
                    MemoWrapper::from_plain(ILP_REL, b"AQAA"),
                ]),
                hash: "HASH1".into(),
            },
            meta: TransactionMeta {
                affected_nodes: vec![AffectedNode {
                    created: Some(NodeDiff {
                        ledger_entry_type: "Escrow".into(),
                        ledger_index: INDEX.into(),
                        new_fields: Some(escrow_fields(1_000)),
                        final_fields: None,
                    }),
                    ..Default::default()
                }],
            },
        }
    }

    fn finish_event() -> TransactionEvent {
        TransactionEvent {
            validated: true,
            engine_result: "tesSUCCESS".into(),
            transaction: RawTransaction {
                transaction_type: TxType::EscrowFinish,
                account: BOB.into(),
                destination: None,
                amount: None,
                sequence: Some(3),
                owner: Some(ALICE.into()),
                offer_sequence: Some(7),
                condition: Some(condition_hex()),
                fulfillment: Some(Fulfillment::new(b"secret".to_vec()).to_ledger()),
                cancel_after: None,
                memos: None,
                hash: "HASH2".into(),
            },
            meta: TransactionMeta {
                affected_nodes: vec![AffectedNode {
                    deleted: Some(NodeDiff {
                        ledger_entry_type: "Escrow".into(),
                        ledger_index: INDEX.into(),
                        new_fields: None,
                        final_fields: Some(escrow_fields(1_000)),
                    }),
                    ..Default::default()
                }],
            },
        }
    }

    #[test]
    fn test_ledger_epoch_conversion() {
        // 2000-01-01T00:00:00Z is second zero of the ledger epoch.
        assert_eq!(
            ledger_time_to_utc(0),
            "2000-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        let now: DateTime<Utc> = "2017-06-07T12:00:00Z".parse().unwrap();
        assert_eq!(ledger_time_to_utc(utc_to_ledger_time(&now)), now);
    }

    #[test]
    fn test_create_translates_to_outgoing_prepare() {
        let translator = Translator::new(ALICE, PREFIX);
        let mut store = TransferStore::new();

        let translated = translator
            .escrow_to_transfer(&mut store, &create_event())
            .unwrap();
        assert_eq!(translated.transfer.id, "t1");
        assert_eq!(translated.transfer.direction, Direction::Outgoing);
        assert_eq!(translated.transfer.amount, 1_000_000);
        assert_eq!(translated.transfer.to, format!("{PREFIX}{BOB}"));
        assert_eq!(translated.transfer.from, format!("{PREFIX}{ALICE}"));
        assert_eq!(translated.transfer.ilp, "AQAA");
        assert_eq!(translated.locator.owner, ALICE);
        assert_eq!(translated.locator.sequence, 7);
        assert_eq!(translated.transfer.expires_at, ledger_time_to_utc(1_000));
    }

    #[test]
    fn test_same_event_is_incoming_for_the_destination() {
        let translator = Translator::new(BOB, PREFIX);
        let mut store = TransferStore::new();

        let translated = translator
            .escrow_to_transfer(&mut store, &create_event())
            .unwrap();
        assert_eq!(translated.transfer.direction, Direction::Incoming);
    }

    #[test]
    fn test_finish_resolves_through_cached_context() {
        let translator = Translator::new(ALICE, PREFIX);
        let mut store = TransferStore::new();

        translator
            .escrow_to_transfer(&mut store, &create_event())
            .unwrap();
        // The finish event has no memos; id and payload come from the cache.
        let translated = translator
            .escrow_to_transfer(&mut store, &finish_event())
            .unwrap();
        assert_eq!(translated.transfer.id, "t1");
        assert_eq!(translated.locator.sequence, 7);
    }

    #[test]
    fn test_finish_without_cached_create_fails() {
        let translator = Translator::new(ALICE, PREFIX);
        let mut store = TransferStore::new();

        assert!(matches!(
            translator.escrow_to_transfer(&mut store, &finish_event()),
            Err(TranslateError::UnknownEscrow(_))
        ));
    }

    #[test]
    fn test_foreign_transaction_is_an_error() {
        let translator = Translator::new("rSOMEONE_ELSE", PREFIX);
        let mut store = TransferStore::new();

        assert!(matches!(
            translator.escrow_to_transfer(&mut store, &create_event()),
            Err(TranslateError::ForeignTransaction)
        ));
    }

    #[test]
    fn test_missing_id_memo_is_an_error() {
        let translator = Translator::new(ALICE, PREFIX);
        let mut store = TransferStore::new();

        let mut event = create_event();
        event.transaction.memos = Some(vec![MemoWrapper::from_plain(ILP_REL, b"AQAA")]);
        assert!(matches!(
            translator.escrow_to_transfer(&mut store, &event),
            Err(TranslateError::MissingMemo(ID_REL))
        ));
    }

    #[test]
    fn test_finish_reveals_fulfillment() {
        let fulfillment = finish_fulfillment(&finish_event()).unwrap();
        assert_eq!(fulfillment.preimage(), b"secret");

        // Falls back to the reveal memo when the native field is absent.
        let mut event = finish_event();
        event.transaction.fulfillment = None;
        event.transaction.memos = Some(vec![MemoWrapper::from_plain(
            FULFILLMENT_REL,
            Fulfillment::new(b"secret".to_vec()).to_protocol().as_bytes(),
        )]);
        let fulfillment = finish_fulfillment(&event).unwrap();
        assert_eq!(fulfillment.preimage(), b"secret");

        event.transaction.memos = None;
        assert!(matches!(
            finish_fulfillment(&event),
            Err(TranslateError::Field("Fulfillment"))
        ));
    }

    #[test]
    fn test_payment_to_message() {
        let translator = Translator::new(BOB, PREFIX);
        let event = TransactionEvent {
            validated: true,
            engine_result: "tesSUCCESS".into(),
            transaction: RawTransaction {
                transaction_type: TxType::Payment,
                account: ALICE.into(),
                destination: Some(BOB.into()),
                amount: Some("1".into()),
                sequence: Some(9),
                owner: None,
                offer_sequence: None,
                condition: None,
                fulfillment: None,
                cancel_after: None,
                memos: Some(vec![
                    MemoWrapper::from_plain(MESSAGE_REL, br#"{"method":"quote"}"#),
                    MemoWrapper::from_plain(MESSAGE_ID_REL, b"req-1"),
                ]),
                hash: "HASH3".into(),
            },
            meta: TransactionMeta::default(),
        };

        let (message, direction) = translator.payment_to_message(&event).unwrap();
        assert_eq!(direction, Direction::Incoming);
        assert_eq!(message.id.as_deref(), Some("req-1"));
        assert_eq!(message.data, serde_json::json!({"method": "quote"}));
        assert_eq!(message.from.as_deref(), Some("g.crypto.ripple.rALICE"));
    }

    #[test]
    fn test_payment_without_memos_defaults() {
        let translator = Translator::new(BOB, PREFIX);
        let event = TransactionEvent {
            validated: true,
            engine_result: "tesSUCCESS".into(),
            transaction: RawTransaction {
                transaction_type: TxType::Payment,
                account: ALICE.into(),
                destination: Some(BOB.into()),
                amount: Some("1".into()),
                sequence: Some(10),
                owner: None,
                offer_sequence: None,
                condition: None,
                fulfillment: None,
                cancel_after: None,
                memos: None,
                hash: "HASH4".into(),
            },
            meta: TransactionMeta::default(),
        };

        let (message, _) = translator.payment_to_message(&event).unwrap();
        assert_eq!(message.data, serde_json::json!({}));
        assert!(message.id.is_some()); // generated
    }
}
