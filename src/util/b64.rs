use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as b64url;

/// Encode raw octets as an unpadded base64url string (RFC 7515 §2).
pub fn encode<T: AsRef<[u8]>>(input: T) -> String {
    b64url.encode(input.as_ref())
}

/// Decode an unpadded base64url string into raw octets.
pub fn decode<T: AsRef<[u8]>>(input: T) -> Result<Vec<u8>, base64::DecodeError> {
    b64url.decode(input.as_ref())
}

/// Decode a base64url string that is expected to contain UTF-8 text.
pub fn decode_utf8<T: AsRef<[u8]>>(input: T) -> Result<String, Base64TextError> {
    let bytes = decode(input)?;
    String::from_utf8(bytes).map_err(Base64TextError::Utf8)
}

/// Error decoding base64url text.
#[derive(Debug, thiserror::Error)]
pub enum Base64TextError {
    #[error(transparent)]
    Decode(#[from] base64::DecodeError),
    #[error("decoded octets are not valid UTF-8: {0}")]
    Utf8(std::string::FromUtf8Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_octets() {
        let data = [0x57u8, 0x46, 0x01, 0x00, 0xff];
        assert_eq!(decode(encode(data)).unwrap(), data);
    }

    #[test]
    fn encodes_without_padding() {
        // "f" encodes to "Zg==" in plain base64; url-safe form drops the padding.
        assert_eq!(encode("f"), "Zg");
        assert_eq!(encode([0xfbu8, 0xff]), "-_8");
    }

    #[test]
    fn round_trips_utf8() {
        let text = "{\"addr\":\"1a2b\"}";
        assert_eq!(decode_utf8(encode(text)).unwrap(), text);
    }

    #[test]
    fn rejects_invalid_alphabet() {
        assert!(decode("not+valid/base64url").is_err());
    }
}
