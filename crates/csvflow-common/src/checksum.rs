//! Storage path fingerprints

/// Number of hex characters kept from the path digest.
pub const FINGERPRINT_LEN: usize = 12;

/// Short deterministic fingerprint of a storage path.
///
/// MD5 of the UTF-8 path, hex encoded and truncated to [`FINGERPRINT_LEN`]
/// characters (48 bits).
pub fn path_fingerprint(storage_path: &str) -> String {
    let digest = md5::compute(storage_path.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Whether `value` has the shape of a fingerprint.
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == FINGERPRINT_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
