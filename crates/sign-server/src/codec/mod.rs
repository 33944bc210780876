//! Symmetric envelope codec shared with the upstream system.
//!
//! The upstream side encrypts request bodies with AES-128 in ECB mode, PKCS#7
//! padding, and a key folded out of a shared secret string. The exact byte
//! layout has to match, so nothing here is configurable.

mod envelope;

use aes::Aes128;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::Pkcs7};

pub use envelope::{EnvelopeError, open_request, seal_data};

type Aes128EcbEnc = ecb::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid key configuration: {0}")]
    Configuration(String),
    #[error("malformed ciphertext: {0}")]
    Encoding(String),
    #[error("invalid padding")]
    Padding,
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Folds `secret` into a 16-byte key by XOR-ing byte `i` into slot `i % 16`.
pub fn derive_key(secret: &str) -> Result<[u8; KEY_LEN]> {
    if secret.is_empty() {
        return Err(CodecError::Configuration("secret must not be empty".into()));
    }

    let mut key = [0u8; KEY_LEN];
    for (i, byte) in secret.as_bytes().iter().enumerate() {
        key[i % KEY_LEN] ^= byte;
    }
    Ok(key)
}

/// AES-128-ECB cipher keyed from a shared secret.
#[derive(Clone)]
pub struct EnvelopeCipher {
    key: [u8; KEY_LEN],
}

impl EnvelopeCipher {
    pub fn new(secret: &str) -> Result<Self> {
        Ok(Self {
            key: derive_key(secret)?,
        })
    }

    /// Encrypts `plaintext` and returns uppercase hex.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let ciphertext = Aes128EcbEnc::new(&self.key.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        hex::encode_upper(ciphertext)
    }

    /// Decrypts hex ciphertext (either case) back into UTF-8 text.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let bytes =
            hex::decode(ciphertext).map_err(|e| CodecError::Encoding(format!("invalid hex: {e}")))?;

        if bytes.len() % BLOCK_LEN != 0 {
            return Err(CodecError::Encoding(format!(
                "ciphertext length {} is not a multiple of {BLOCK_LEN}",
                bytes.len()
            )));
        }

        let plaintext = Aes128EcbDec::new(&self.key.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
            .map_err(|_| CodecError::Padding)?;

        String::from_utf8(plaintext)
            .map_err(|e| CodecError::Encoding(format!("plaintext is not UTF-8: {e}")))
    }
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher").finish_non_exhaustive()
    }
}

pub fn encrypt(secret: &str, plaintext: &str) -> Result<String> {
    Ok(EnvelopeCipher::new(secret)?.encrypt(plaintext))
}

/// Decrypts `ciphertext`, yielding `None` only when no ciphertext was given.
pub fn decrypt(secret: &str, ciphertext: Option<&str>) -> Result<Option<String>> {
    let Some(ciphertext) = ciphertext else {
        return Ok(None);
    };
    EnvelopeCipher::new(secret)?.decrypt(ciphertext).map(Some)
}
