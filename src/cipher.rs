//! Content cipher for the `content` request field.
//!
//! Envelope layout: `base64(IV || AES-256-CBC(PKCS#7(plaintext)))` with a fresh
//! 16-byte IV per call. The AES key is `SHA-256(secret)`, so secrets of any
//! length map onto a valid 256-bit key.
//!
//! There is no authentication tag. A tampered envelope that still unpads,
//! decodes as UTF-8 and parses as whatever the caller expects is accepted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes; also the IV length.
pub const BLOCK_SIZE: usize = 16;

const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("invalid base64 envelope: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed envelope: {len} bytes after decoding")]
    MalformedEnvelope { len: usize },
    #[error("invalid padding")]
    BadPadding,
    #[error("decrypted content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, CipherError>;

/// AES-256-CBC wrapper keyed by a hashed shared secret.
pub struct AesCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl AesCipher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&Sha256::digest(secret.as_ref()));
        Self { key }
    }

    /// Encrypt `plaintext` into a transport-ready envelope.
    ///
    /// Two calls with the same input produce different envelopes because the
    /// IV is drawn from the OS RNG every time.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);

        let padded = pad(plaintext);
        let ciphertext = Aes256CbcEnc::new(self.key.as_slice().into(), iv.as_slice().into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded);

        let mut framed = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        STANDARD.encode(framed)
    }

    /// Reverse [`AesCipher::encrypt`]. A wrong key usually surfaces as
    /// [`CipherError::BadPadding`] or [`CipherError::Utf8`].
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let raw = STANDARD.decode(envelope.trim())?;
        if raw.len() < 2 * BLOCK_SIZE || raw.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::MalformedEnvelope { len: raw.len() });
        }

        let (iv, ciphertext) = raw.split_at(BLOCK_SIZE);
        let padded = Aes256CbcDec::new(self.key.as_slice().into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CipherError::MalformedEnvelope { len: raw.len() })?;

        let plaintext = unpad(padded)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

/// PKCS#7 padding: always appends 1..=BLOCK_SIZE bytes whose value equals the
/// pad length, so aligned input gains a whole block.
pub fn pad(message: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - message.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(message.len() + pad_len);
    out.extend_from_slice(message);
    out.resize(message.len() + pad_len, pad_len as u8);
    out
}

/// Strip padding by reading the trailing byte as the pad length.
pub fn unpad(mut message: Vec<u8>) -> Result<Vec<u8>> {
    let pad_len = match message.last() {
        Some(&b) => b as usize,
        None => return Err(CipherError::BadPadding),
    };
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > message.len() {
        return Err(CipherError::BadPadding);
    }
    message.truncate(message.len() - pad_len);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("secret", "")]
    #[case("secret", "{\"foo\": \"bar\"}")]
    #[case("", "sixteen byte msg")]
    #[case("a much longer secret than any AES key would accept as-is", "ümlaut → ünïcode")]
    fn decrypt_reverses_encrypt(#[case] secret: &str, #[case] plaintext: &str) {
        let cipher = AesCipher::new(secret);
        let envelope = cipher.encrypt(plaintext.as_bytes());
        assert_eq!(cipher.decrypt(&envelope).expect("decrypt"), plaintext);
    }

    #[test]
    fn round_trip_every_length_up_to_three_blocks() {
        let cipher = AesCipher::new("lengths");
        for n in 0..=(3 * BLOCK_SIZE) {
            let plaintext = "x".repeat(n);
            let envelope = cipher.encrypt(plaintext.as_bytes());
            assert_eq!(cipher.decrypt(&envelope).unwrap(), plaintext, "length {n}");
        }
    }

    #[test]
    fn padding_length_stays_within_one_block() {
        for n in 0..=(2 * BLOCK_SIZE + 1) {
            let msg = vec![0xAB; n];
            let padded = pad(&msg);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            let added = padded.len() - n;
            assert!((1..=BLOCK_SIZE).contains(&added), "length {n} added {added}");
            assert!(padded[n..].iter().all(|&b| b as usize == added));
        }
    }

    #[test]
    fn aligned_and_empty_input_get_a_full_block() {
        assert_eq!(pad(&[]), vec![BLOCK_SIZE as u8; BLOCK_SIZE]);
        assert_eq!(pad(&[1u8; BLOCK_SIZE]).len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn unpad_rejects_out_of_range_trailer() {
        assert!(matches!(unpad(vec![]), Err(CipherError::BadPadding)));
        assert!(matches!(unpad(vec![1, 2, 0]), Err(CipherError::BadPadding)));
        assert!(matches!(unpad(vec![17; 32]), Err(CipherError::BadPadding)));
        assert!(matches!(unpad(vec![4, 4, 4]), Err(CipherError::BadPadding)));
        assert_eq!(unpad(vec![9, 9, 2, 2]).unwrap(), vec![9, 9]);
    }

    #[test]
    fn encrypt_uses_a_fresh_iv() {
        let cipher = AesCipher::new("nonce");
        let a = cipher.encrypt(b"same input");
        let b = cipher.encrypt(b"same input");
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "same input");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same input");
    }

    #[test]
    fn envelope_length_is_iv_plus_whole_blocks() {
        let envelope = AesCipher::new("k").encrypt(b"hello");
        let raw = STANDARD.decode(envelope).unwrap();
        assert_eq!(raw.len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn malformed_envelopes_are_errors() {
        let cipher = AesCipher::new("k");
        assert!(matches!(
            cipher.decrypt("not base64!!"),
            Err(CipherError::Base64(_))
        ));
        // IV only, no ciphertext block
        let iv_only = STANDARD.encode([0u8; BLOCK_SIZE]);
        assert!(matches!(
            cipher.decrypt(&iv_only),
            Err(CipherError::MalformedEnvelope { len: 16 })
        ));
        let ragged = STANDARD.encode([0u8; BLOCK_SIZE + 5]);
        assert!(matches!(
            cipher.decrypt(&ragged),
            Err(CipherError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn wrong_key_never_yields_the_plaintext() {
        let envelope = AesCipher::new("right").encrypt(b"{\"foo\": \"bar\"}");
        match AesCipher::new("wrong").decrypt(&envelope) {
            Ok(text) => assert_ne!(text, "{\"foo\": \"bar\"}"),
            Err(_) => {}
        }
    }
}
