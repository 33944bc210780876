use serde_json::Value;
use tracing::{debug, info};

use super::{CodecError, EnvelopeCipher};

/// Length of ciphertext previews written to the log.
const PREVIEW_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("request body must not be empty")]
    EmptyBody,
    #[error("request body is not text: {0}")]
    NotText(#[from] std::str::Utf8Error),
    #[error("failed to decrypt request body: {0}")]
    Decrypt(#[from] CodecError),
    #[error("decrypted body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decrypts a hex ciphertext request body and parses the JSON inside it.
pub fn open_request(cipher: &EnvelopeCipher, body: &[u8]) -> Result<Value, EnvelopeError> {
    if body.is_empty() {
        return Err(EnvelopeError::EmptyBody);
    }

    let ciphertext = std::str::from_utf8(body)?.trim();
    info!(
        len = ciphertext.len(),
        preview = preview(ciphertext),
        "received encrypted request body"
    );

    let plaintext = cipher.decrypt(ciphertext)?;
    debug!(len = plaintext.len(), "decrypted request body");

    Ok(serde_json::from_str(&plaintext)?)
}

/// Encrypts `data` when it is an object or array; other values pass through.
pub fn seal_data(cipher: &EnvelopeCipher, data: Value) -> Value {
    match data {
        Value::Object(_) | Value::Array(_) => {
            let plaintext = data.to_string();
            let ciphertext = cipher.encrypt(&plaintext);
            debug!(
                plaintext_len = plaintext.len(),
                ciphertext_len = ciphertext.len(),
                "encrypted response data"
            );
            Value::String(ciphertext)
        }
        other => other,
    }
}

fn preview(s: &str) -> &str {
    match s.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
