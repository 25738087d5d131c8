//! Crypto-condition codec
//!
//! Narrow adapter between the protocol representation of a condition (URL-safe
//! unpadded base64 of a raw SHA-256 digest) and the ledger's DER-encoded
//! PREIMAGE-SHA-256 record, which travels as upper-case hex.
//!
//! Only the PREIMAGE-SHA-256 type is supported; decoding any other condition
//! type is an error.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// DER context tag wrapping a PREIMAGE-SHA-256 condition or fulfillment.
const TAG_PREIMAGE_SHA256: u8 = 0xA0;
/// Inner tag for the digest (condition) or the preimage (fulfillment).
const TAG_CONTENT: u8 = 0x80;
/// Inner tag for the declared cost (condition only).
const TAG_COST: u8 = 0x81;

/// Length of the committed SHA-256 digest.
pub const CONDITION_HASH_LEN: usize = 32;

/// PREIMAGE-SHA-256 declares a fixed cost equal to the digest length.
pub const CONDITION_COST: u64 = 32;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("condition hash must be {CONDITION_HASH_LEN} bytes, got {0}")]
    BadHashLength(usize),

    #[error("unsupported condition type (tag 0x{0:02X})")]
    UnsupportedType(u8),

    #[error("declared cost {0} is not valid for PREIMAGE-SHA-256")]
    BadCost(u64),

    #[error("truncated or malformed condition record")]
    Malformed,
}

/// A 32-byte SHA-256 commitment to a preimage.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition([u8; CONDITION_HASH_LEN]);

impl Condition {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConditionError> {
        let hash: [u8; CONDITION_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| ConditionError::BadHashLength(bytes.len()))?;
        Ok(Condition(hash))
    }

    pub fn as_bytes(&self) -> &[u8; CONDITION_HASH_LEN] {
        &self.0
    }

    /// Protocol encoding: unpadded base64url of the raw digest.
    pub fn to_protocol(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_protocol(s: &str) -> Result<Self, ConditionError> {
        Self::from_bytes(&URL_SAFE_NO_PAD.decode(s)?)
    }

    /// Ledger encoding: upper-case hex of the DER condition record.
    pub fn to_ledger(&self) -> String {
        let mut body = Vec::with_capacity(CONDITION_HASH_LEN + 8);
        body.push(TAG_CONTENT);
        write_der_len(&mut body, CONDITION_HASH_LEN);
        body.extend_from_slice(&self.0);
        body.push(TAG_COST);
        let cost = encode_cost(CONDITION_COST);
        write_der_len(&mut body, cost.len());
        body.extend_from_slice(&cost);

        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(TAG_PREIMAGE_SHA256);
        write_der_len(&mut out, body.len());
        out.extend_from_slice(&body);
        hex::encode_upper(out)
    }

    pub fn from_ledger(s: &str) -> Result<Self, ConditionError> {
        let raw = hex::decode(s)?;
        let body = read_envelope(&raw)?;

        let (hash, rest) = read_der_field(body, TAG_CONTENT)?;
        let condition = Self::from_bytes(hash)?;

        let (cost_bytes, rest) = read_der_field(rest, TAG_COST)?;
        let cost = decode_cost(cost_bytes)?;
        if cost != CONDITION_COST {
            return Err(ConditionError::BadCost(cost));
        }
        if !rest.is_empty() {
            return Err(ConditionError::Malformed);
        }
        Ok(condition)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_protocol())
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.to_protocol())
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_protocol(s)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_protocol())
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_protocol(&s).map_err(D::Error::custom)
    }
}

/// The preimage that reveals a [`Condition`]. Arbitrary length.
#[derive(Clone, PartialEq, Eq)]
pub struct Fulfillment(Vec<u8>);

impl Fulfillment {
    pub fn new(preimage: impl Into<Vec<u8>>) -> Self {
        Fulfillment(preimage.into())
    }

    pub fn preimage(&self) -> &[u8] {
        &self.0
    }

    /// The condition this preimage fulfills (protocol digest).
    pub fn condition(&self) -> Condition {
        let digest: [u8; CONDITION_HASH_LEN] = Sha256::digest(&self.0).into();
        Condition(digest)
    }

    /// Protocol encoding: unpadded base64url of the raw preimage.
    pub fn to_protocol(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_protocol(s: &str) -> Result<Self, ConditionError> {
        Ok(Fulfillment(URL_SAFE_NO_PAD.decode(s)?))
    }

    /// Ledger encoding: upper-case hex of the DER fulfillment record.
    pub fn to_ledger(&self) -> String {
        let mut body = Vec::with_capacity(self.0.len() + 4);
        body.push(TAG_CONTENT);
        write_der_len(&mut body, self.0.len());
        body.extend_from_slice(&self.0);

        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(TAG_PREIMAGE_SHA256);
        write_der_len(&mut out, body.len());
        out.extend_from_slice(&body);
        hex::encode_upper(out)
    }

    pub fn from_ledger(s: &str) -> Result<Self, ConditionError> {
        let raw = hex::decode(s)?;
        let body = read_envelope(&raw)?;
        let (preimage, rest) = read_der_field(body, TAG_CONTENT)?;
        if !rest.is_empty() {
            return Err(ConditionError::Malformed);
        }
        Ok(Fulfillment(preimage.to_vec()))
    }
}

impl fmt::Display for Fulfillment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_protocol())
    }
}

impl fmt::Debug for Fulfillment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fulfillment({})", self.to_protocol())
    }
}

impl FromStr for Fulfillment {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_protocol(s)
    }
}

impl Serialize for Fulfillment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_protocol())
    }
}

impl<'de> Deserialize<'de> for Fulfillment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_protocol(&s).map_err(D::Error::custom)
    }
}

// DER length octets: short form below 128, long form 0x81/0x82 above.
fn write_der_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

fn read_der_len(buf: &[u8]) -> Result<(usize, usize), ConditionError> {
    let first = *buf.first().ok_or(ConditionError::Malformed)?;
    match first {
        0x00..=0x7F => Ok((first as usize, 1)),
        0x81 => {
            let len = *buf.get(1).ok_or(ConditionError::Malformed)? as usize;
            Ok((len, 2))
        }
        0x82 => {
            let hi = *buf.get(1).ok_or(ConditionError::Malformed)? as usize;
            let lo = *buf.get(2).ok_or(ConditionError::Malformed)? as usize;
            Ok(((hi << 8) | lo, 3))
        }
        _ => Err(ConditionError::Malformed),
    }
}

/// Strip the outer PREIMAGE-SHA-256 envelope, returning its contents.
fn read_envelope(raw: &[u8]) -> Result<&[u8], ConditionError> {
    let tag = *raw.first().ok_or(ConditionError::Malformed)?;
    if tag != TAG_PREIMAGE_SHA256 {
        return Err(ConditionError::UnsupportedType(tag));
    }
    let (len, consumed) = read_der_len(&raw[1..])?;
    let body = raw
        .get(1 + consumed..1 + consumed + len)
        .ok_or(ConditionError::Malformed)?;
    if raw.len() != 1 + consumed + len {
        return Err(ConditionError::Malformed);
    }
    Ok(body)
}

/// Read one tagged field, returning its value and the remaining bytes.
fn read_der_field(buf: &[u8], tag: u8) -> Result<(&[u8], &[u8]), ConditionError> {
    let found = *buf.first().ok_or(ConditionError::Malformed)?;
    if found != tag {
        return Err(ConditionError::Malformed);
    }
    let (len, consumed) = read_der_len(&buf[1..])?;
    let value = buf
        .get(1 + consumed..1 + consumed + len)
        .ok_or(ConditionError::Malformed)?;
    Ok((value, &buf[1 + consumed + len..]))
}

/// Minimal big-endian cost encoding (at least one octet).
fn encode_cost(cost: u64) -> Vec<u8> {
    let bytes = cost.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

fn decode_cost(bytes: &[u8]) -> Result<u64, ConditionError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(ConditionError::Malformed);
    }
    let mut cost = 0u64;
    for b in bytes {
        cost = (cost << 8) | *b as u64;
    }
    Ok(cost)
}
