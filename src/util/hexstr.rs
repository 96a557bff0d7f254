//! Canonical on-the-wire hex forms.
//!
//! The relay's API form for hex fields is lowercase hex without a `0x`
//! prefix. Addresses are the one exception: their character case is kept
//! as-is, since some chains carry a checksum in the letter casing.
//! secp256k1 public keys are exchanged in SEC uncompressed form, 130 hex
//! characters with a leading `04` byte.

/// Marker byte of an uncompressed SEC public key, as a hex pair.
const SEC_UNCOMPRESSED_PREFIX: &str = "04";

/// Strips a `0x`/`0X` prefix if present. Idempotent.
pub fn no_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// Prepends `0x` unless already present. Idempotent.
pub fn with_hex_prefix(s: &str) -> String {
    if s.starts_with("0x") || s.starts_with("0X") {
        s.to_owned()
    } else {
        format!("0x{s}")
    }
}

/// Converts a hex string (with or without `0x`) to canonical API form:
/// lowercase, no prefix.
pub fn to_api_form(s: &str) -> String {
    no_hex_prefix(s).to_lowercase()
}

/// Converts an address to API form: prefix stripped, case preserved.
pub fn address_to_api_form(s: &str) -> String {
    no_hex_prefix(s).to_owned()
}

/// Normalizes a secp256k1 public key to SEC uncompressed API form.
///
/// A 128-character input is taken as a raw point and gets the `04` marker
/// prepended; a 130-character input must already carry it.
pub fn public_key_to_api_form(s: &str) -> Result<String, HexFormatError> {
    let key = to_api_form(s);
    if !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HexFormatError::NotHex(s.to_owned()));
    }
    match key.len() {
        128 => Ok(format!("{SEC_UNCOMPRESSED_PREFIX}{key}")),
        130 if key.starts_with(SEC_UNCOMPRESSED_PREFIX) => Ok(key),
        _ => Err(HexFormatError::InvalidPublicKey(key.len())),
    }
}

/// Decodes a hex string (with or without `0x` prefix) into octets.
pub fn decode(s: &str) -> Result<Vec<u8>, HexFormatError> {
    hex::decode(no_hex_prefix(s)).map_err(|_| HexFormatError::NotHex(s.to_owned()))
}

/// Encodes octets as lowercase hex without prefix.
pub fn encode<T: AsRef<[u8]>>(bytes: T) -> String {
    hex::encode(bytes.as_ref())
}

/// Malformed hex input.
#[derive(Debug, thiserror::Error)]
pub enum HexFormatError {
    #[error("not a hexadecimal string: {0}")]
    NotHex(String),
    #[error("public key must be 128 or 130 hex characters, got {0}")]
    InvalidPublicKey(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stripping_is_idempotent() {
        assert_eq!(no_hex_prefix("0xdeadbeef"), "deadbeef");
        assert_eq!(no_hex_prefix(no_hex_prefix("0xdeadbeef")), "deadbeef");
        assert_eq!(no_hex_prefix("deadbeef"), "deadbeef");
    }

    #[test]
    fn prefix_adding_is_idempotent() {
        assert_eq!(with_hex_prefix("deadbeef"), "0xdeadbeef");
        assert_eq!(with_hex_prefix(&with_hex_prefix("deadbeef")), "0xdeadbeef");
    }

    #[test]
    fn api_form_lowercases() {
        assert_eq!(to_api_form("0xDEADbeef"), "deadbeef");
    }

    #[test]
    fn address_form_preserves_case() {
        assert_eq!(
            address_to_api_form("0x7cB57B5A97eAbe94205C07890BE4c1aD31E486A8"),
            "7cB57B5A97eAbe94205C07890BE4c1aD31E486A8"
        );
    }

    #[test]
    fn public_key_gets_sec_marker() {
        let raw = "a".repeat(128);
        let key = public_key_to_api_form(&raw).unwrap();
        assert_eq!(key.len(), 130);
        assert!(key.starts_with("04"));
        // Already-marked keys pass through unchanged.
        assert_eq!(public_key_to_api_form(&key).unwrap(), key);
    }

    #[test]
    fn public_key_rejects_odd_lengths() {
        assert!(public_key_to_api_form("abcd").is_err());
        assert!(public_key_to_api_form(&"a".repeat(131)).is_err());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x57, 0x46, 0x00, 0xab];
        assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
        assert_eq!(decode("0x574600ab").unwrap(), bytes);
    }
}
