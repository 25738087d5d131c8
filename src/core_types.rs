//! Core types used throughout the plugin
//!
//! Fundamental aliases and small identity types shared by all modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer ID - caller-assigned, globally unique per sender.
///
/// # Constraints:
/// - **Immutable**: once a transfer is ledger-backed, the id never changes
/// - **Opaque**: the ledger only ever sees it inside a memo
pub type TransferId = String;

/// Raw ledger account, e.g. `rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh`.
pub type LedgerAddress = String;

/// Integer ledger amount in drops (1 XRP = 10^6 drops).
pub type Drops = u64;

/// Account sequence number consumed by one submitted transaction.
pub type SequenceNumber = u32;

/// Currency code reported by `get_info`.
pub const CURRENCY_CODE: &str = "XRP";

/// Fixed-point scale of the ledger amount (drops per XRP, as a power of ten).
pub const CURRENCY_SCALE: u8 = 6;

/// Which side of a ledger transaction this plugin instance is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The (owner, sequence) pair that permanently identifies one escrow
/// across its create/finish/cancel lifecycle.
///
/// Finish and cancel transactions reference the escrow by this pair, not by
/// the protocol transfer id (that one is only recoverable from a memo on the
/// creation transaction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscrowLocator {
    pub owner: LedgerAddress,
    pub sequence: SequenceNumber,
}

impl fmt::Display for EscrowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.sequence)
    }
}
