//! Domain-separated SHA-256 hashing over canonical bytes.
//!
//! `typed_hash(kind, payload) = sha256(domain[kind] || canonicalize(payload))`.
//! The domain table is closed: adding a kind is an API change, not a runtime
//! configuration. `chain_digest` is the one exception that hashes raw
//! 32-byte inputs directly, with no canonicalization step.

use std::fmt;
use std::str::FromStr;

use coh_canon::Profile;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The closed set of object kinds this crate knows how to domain-separate.
/// `Proposal` carries the proposal object's own kind string (e.g. a
/// candidate type) to build the `"NPE|1.0|<kind>|"` separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKind {
    Request,
    Response,
    Candidate,
    ReceiptId,
    Chain,
    Registry,
    MerkleLeaf,
    MerkleInternal,
    Proposal(String),
}

fn domain_bytes(kind: &HashKind) -> Vec<u8> {
    match kind {
        HashKind::ReceiptId => b"COH_RECEIPT_ID_V1\n".to_vec(),
        HashKind::Chain => b"COH_CHAIN_DIGEST_V1\n".to_vec(),
        HashKind::MerkleLeaf => vec![0x00],
        HashKind::MerkleInternal => vec![0x01],
        HashKind::Registry => b"registry".to_vec(),
        HashKind::Request => b"COH_REQUEST_V1\n".to_vec(),
        HashKind::Response => b"COH_RESPONSE_V1\n".to_vec(),
        HashKind::Candidate => b"COH_CANDIDATE_V1\n".to_vec(),
        HashKind::Proposal(kind) => format!("NPE|1.0|{kind}|").into_bytes(),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: {0} hex characters (expected 64)")]
    BadLength(usize),
    #[error("invalid hex characters in hash")]
    BadHex,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypedHashError {
    #[error(transparent)]
    Canon(#[from] coh_canon::CanonError),
}

/// A 32-byte SHA-256 digest. The only textual form that ever leaves the
/// process is `sha256:` followed by 64 lowercase hex characters; a bare-hex
/// string is accepted on the way in for backwards compatibility but is
/// never produced by `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_raw(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, HashError> {
        let hex_part = s.strip_prefix("sha256:").unwrap_or(s);
        if hex_part.len() != 64 {
            return Err(HashError::BadLength(hex_part.len()));
        }
        let mut raw = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut raw).map_err(|_| HashError::BadHex)?;
        Ok(Hash(raw))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// `typed_hash(kind, payload) = sha256(domain[kind] || canonicalize(payload))`.
pub fn typed_hash<T: Serialize>(
    kind: &HashKind,
    payload: &T,
    profile: Profile,
) -> Result<Hash, TypedHashError> {
    let canonical = coh_canon::to_canonical_bytes(payload, profile)?;
    Ok(typed_hash_bytes(kind, &canonical))
}

/// Same as `typed_hash` but over already-canonicalized bytes, for callers
/// that canonicalize once and hash under more than one domain.
pub fn typed_hash_bytes(kind: &HashKind, canonical_bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(domain_bytes(kind));
    hasher.update(canonical_bytes);
    Hash(hasher.finalize().into())
}

/// `chain_digest(prev, receipt_id) = sha256(domain["chain"] || prev || receipt_id)`.
/// Raw 32-byte inputs only — no canonicalization. The genesis link uses
/// `Hash::ZERO` as `prev`.
pub fn chain_digest(prev: &Hash, receipt_id: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(domain_bytes(&HashKind::Chain));
    hasher.update(prev.as_raw());
    hasher.update(receipt_id.as_raw());
    Hash(hasher.finalize().into())
}
