//! Hashing and key-derivation primitives.
//!
//! Everything here operates on raw octets and returns either lowercase hex
//! or a [`Zeroizing`] buffer. Input key material handed to [`hkdf`] is wiped
//! as soon as the extract step has consumed it; callers hold no live copy
//! afterwards.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Computes SHA-256 over `data` and returns lowercase hex.
///
/// When `length` is given, the hex output is truncated to `2 * length`
/// characters, i.e. the first `length` bytes of the digest.
pub fn hash<T: AsRef<[u8]>>(data: T, length: Option<usize>) -> String {
    let digest = Sha256::digest(data.as_ref());
    let mut out = hex::encode(digest);
    if let Some(n) = length {
        out.truncate(2 * n);
    }
    out
}

/// HKDF per RFC 5869 over SHA-256.
///
/// Derives `length` bytes of output key material. The input key material is
/// zeroised after the extract step, on both success and failure paths.
pub fn hkdf(
    ikm: &mut [u8],
    salt: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    ikm.zeroize();
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|_| KeyDerivationError::InvalidLength(length))?;
    Ok(okm)
}

/// Overwrites every byte with zero and returns the buffer.
pub fn zeroise(buffer: &mut [u8]) -> &mut [u8] {
    buffer.zeroize();
    buffer
}

/// Key derivation failure.
#[derive(Debug, thiserror::Error)]
pub enum KeyDerivationError {
    #[error("cannot derive {0} bytes of output key material")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hash(b"", None),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash(b"abc", None),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn truncates_to_requested_bytes() {
        let h = hash(b"abc", Some(12));
        assert_eq!(h.len(), 24);
        assert_eq!(h, "ba7816bf8f01cfea414140de");
    }

    #[test]
    fn hkdf_rfc5869_case_1() {
        // RFC 5869 appendix A.1 test vector.
        let mut ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();
        let okm = hkdf(&mut ikm, &salt, &info, 42).unwrap();
        assert_eq!(
            hex::encode(okm.as_slice()),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
        // Input key material is wiped after extract.
        assert!(ikm.iter().all(|b| *b == 0));
    }

    #[test]
    fn hkdf_rejects_oversized_output() {
        let mut ikm = [0x0bu8; 22];
        // RFC 5869 caps output at 255 * hash length.
        assert!(hkdf(&mut ikm, &[], &[], 255 * 32 + 1).is_err());
    }

    #[test]
    fn zeroise_clears_buffer() {
        let mut buf = [0xffu8; 16];
        zeroise(&mut buf);
        assert_eq!(buf, [0u8; 16]);
    }
}
