//! Utility functions for identifiers and storage keys

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::{BankError, Result};
use crate::types::BloodGroup;

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| BankError::Codec(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| BankError::Codec(e.to_string()))?;
    Ok(encode)
}

/// Ledger keys sort by category first, then by the monotonic entry id, so a
/// prefix scan walks one category in commit order.
pub(crate) fn ledger_key(category: BloodGroup, id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = category.code();
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}
