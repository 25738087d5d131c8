//! Plugin configuration
//!
//! All tuning constants live here so nothing operational is hard-coded.

use crate::errors::PluginError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ILP address prefix for transfers riding this ledger.
pub const DEFAULT_PREFIX: &str = "g.crypto.ripple.";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PluginConfig {
    /// Ledger endpoint handed to the wrapped client, e.g. `wss://s1.ripple.com`.
    pub server: String,

    /// Signing secret for this account.
    pub secret: String,

    /// Ledger address. Derived from the secret when omitted; when given it
    /// must match the derived address.
    #[serde(default)]
    pub address: Option<String>,

    /// ILP address prefix prepended to ledger accounts.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Buffer added on top of `expires_at` before a cancellation is
    /// submitted. The escrow's cancel-after window is measured in ledger
    /// consensus time, which may trail the local clock; cancelling exactly at
    /// expiry gets rejected until the ledger catches up.
    #[serde(default = "default_expiry_grace_ms")]
    pub expiry_grace_ms: u64,

    /// Retry policy for cancellations the ledger rejects transiently.
    #[serde(default)]
    pub cancel_retry: RetryPolicy,

    /// Pause between cancellation retries. Zero retries immediately.
    #[serde(default = "default_cancel_retry_delay_ms")]
    pub cancel_retry_delay_ms: u64,

    /// Default deadline for `send_request` when the message carries none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long terminal transfers are retained before eviction. `None`
    /// keeps every record for the lifetime of the process.
    #[serde(default)]
    pub terminal_retention_ms: Option<u64>,
}

/// Bounded or unbounded retry for rejected cancellations.
///
/// The original behavior is unbounded: a transfer whose cancellation keeps
/// being rejected transiently is never given up on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    Unbounded,
    /// At most this many retries after the initial attempt.
    Limited(u32),
}

impl RetryPolicy {
    /// Whether another retry is allowed after `failures` failed attempts.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Limited(max) => failures <= *max,
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_expiry_grace_ms() -> u64 {
    5_000
}

fn default_cancel_retry_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl PluginConfig {
    pub fn new(server: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            secret: secret.into(),
            address: None,
            prefix: default_prefix(),
            expiry_grace_ms: default_expiry_grace_ms(),
            cancel_retry: RetryPolicy::default(),
            cancel_retry_delay_ms: default_cancel_retry_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            terminal_retention_ms: None,
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, PluginError> {
        let config: PluginConfig = serde_yaml::from_str(content)
            .map_err(|e| PluginError::InvalidFields(format!("bad config yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.server.is_empty() {
            return Err(PluginError::InvalidFields("server must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(PluginError::InvalidFields("secret must not be empty".into()));
        }
        if !self.prefix.ends_with('.') {
            return Err(PluginError::InvalidFields(format!(
                "prefix must end with '.': {}",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn expiry_grace(&self) -> Duration {
        Duration::from_millis(self.expiry_grace_ms)
    }

    pub fn cancel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cancel_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn terminal_retention(&self) -> Option<Duration> {
        self.terminal_retention_ms.map(Duration::from_millis)
    }
}
