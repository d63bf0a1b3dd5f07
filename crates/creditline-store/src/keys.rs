//! Key encoding utilities for `RocksDB`.
//!
//! Secondary indexes are `owner (16 bytes) || child`, so a prefix scan over
//! the owner yields its children in key order. ULID children sort by time.

use creditline_core::{AccountId, PaymentProvider};

/// Length of an encoded UUID or ULID.
pub const ID_LEN: usize = 16;

/// Create an account key from an account id.
#[must_use]
pub fn account_key(id: &AccountId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create an owner-scoped index key.
///
/// Format: `owner (16 bytes) || child`.
#[must_use]
pub fn owned_key(owner: &AccountId, child: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN + child.len());
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(child);
    key
}

/// Create a ledger index key.
///
/// Format: `account_id (16 bytes) || seq (8 bytes, big-endian)`.
#[must_use]
pub fn ledger_index_key(account: &AccountId, seq: u64) -> Vec<u8> {
    owned_key(account, &seq.to_be_bytes())
}

/// Create a prefix for iterating everything an account owns in an index.
#[must_use]
pub fn owner_prefix(owner: &AccountId) -> Vec<u8> {
    owner.as_bytes().to_vec()
}

/// Extract the 16-byte child id from an owner-scoped index key.
///
/// Returns `None` if the key is not exactly 32 bytes.
#[must_use]
pub fn child_id(key: &[u8]) -> Option<[u8; ID_LEN]> {
    if key.len() != 2 * ID_LEN {
        return None;
    }
    let mut bytes = [0u8; ID_LEN];
    bytes.copy_from_slice(&key[ID_LEN..]);
    Some(bytes)
}

/// Decode a stored 16-byte id value.
#[must_use]
pub fn id_bytes(value: &[u8]) -> Option<[u8; ID_LEN]> {
    value.try_into().ok()
}

/// Create a provider-scoped key (`provider:value`).
#[must_use]
pub fn provider_key(provider: PaymentProvider, value: &str) -> Vec<u8> {
    format!("{}:{value}", provider.as_str()).into_bytes()
}
