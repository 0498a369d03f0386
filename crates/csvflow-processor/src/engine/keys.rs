//! Row key generation
//!
//! Keys are `{fingerprint}_{row_number:010}`. The fixed-width row number makes
//! lexicographic order equal row order within a file, while the fingerprint
//! prefix spreads files across the key space.

use csvflow_common::checksum::{is_fingerprint, path_fingerprint};
use csvflow_common::types::ObjectRef;

use super::types::RowKey;
use crate::error::CapacityError;

/// Digits in the zero-padded row number.
pub const ROW_NUMBER_WIDTH: usize = 10;

/// Largest row number representable in [`ROW_NUMBER_WIDTH`] digits.
pub const MAX_ROW_NUMBER: u64 = 9_999_999_999;

/// Prefix of per-file summary keys.
pub const SUMMARY_KEY_PREFIX: &str = "_summary_";

/// Deterministic fingerprint of an object's storage path.
pub fn fingerprint(object: &ObjectRef) -> String {
    path_fingerprint(&object.storage_path())
}

/// Key of data row `row_number` (1-based) of the file with `fingerprint`.
pub fn row_key(fingerprint: &str, row_number: u64) -> Result<RowKey, CapacityError> {
    if row_number == 0 || row_number > MAX_ROW_NUMBER {
        return Err(CapacityError {
            row_number,
            limit: MAX_ROW_NUMBER,
        });
    }
    Ok(RowKey::new(format!(
        "{}_{:0width$}",
        fingerprint,
        row_number,
        width = ROW_NUMBER_WIDTH
    )))
}

/// Key of the file's summary record.
pub fn summary_key(fingerprint: &str) -> RowKey {
    RowKey::new(format!("{}{}", SUMMARY_KEY_PREFIX, fingerprint))
}

/// Split a data row key back into fingerprint and row number.
pub fn parse_row_key(key: &str) -> Option<(&str, u64)> {
    let (fp, number) = key.split_once('_')?;
    if !is_fingerprint(fp) || number.len() != ROW_NUMBER_WIDTH {
        return None;
    }
    if !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((fp, number.parse().ok()?))
}
