//! Secrets boundary.
//!
//! Secret property values are wrapped as ciphertext before a snapshot leaves
//! the engine and unwrapped when it is loaded back. The engine never holds
//! keys itself: callers supply an [`Encrypter`] and a [`Decrypter`].
//!
//! Persisted secrets use the same signed object as the wire form, with the
//! plaintext `value` replaced by a `ciphertext` string holding the encrypted
//! JSON encoding of the value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SecretsError;
use crate::resource::{SECRET_SIGNATURE, SIGNATURE_KEY};

/// Placeholder written by [`BlindingCrypter`].
pub const BLINDED_SECRET: &str = "[secret]";

/// Encrypts secret plaintexts.
#[async_trait]
pub trait Encrypter: Send + Sync {
    /// Encrypts a single plaintext.
    async fn encrypt_value(&self, plaintext: &str) -> Result<String, SecretsError>;

    /// Encrypts many plaintexts, preserving order.
    async fn batch_encrypt(&self, plaintexts: &[String]) -> Result<Vec<String>, SecretsError> {
        let mut ciphertexts = Vec::with_capacity(plaintexts.len());
        for plaintext in plaintexts {
            ciphertexts.push(self.encrypt_value(plaintext).await?);
        }
        Ok(ciphertexts)
    }
}

/// Decrypts secret ciphertexts.
#[async_trait]
pub trait Decrypter: Send + Sync {
    /// Decrypts a single ciphertext.
    async fn decrypt_value(&self, ciphertext: &str) -> Result<String, SecretsError>;

    /// Decrypts many ciphertexts, preserving order.
    async fn batch_decrypt(&self, ciphertexts: &[String]) -> Result<Vec<String>, SecretsError> {
        let mut plaintexts = Vec::with_capacity(ciphertexts.len());
        for ciphertext in ciphertexts {
            plaintexts.push(self.decrypt_value(ciphertext).await?);
        }
        Ok(plaintexts)
    }
}

/// Describes the secrets provider a snapshot was written with.
///
/// The engine records this opaquely so a later run can pick the matching
/// decrypter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsProviderInfo {
    /// Provider kind, e.g. `passphrase` or `awskms`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider-specific state such as a salt or key id.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub state: Value,
}

/// Crypter for stacks without a secrets provider.
///
/// Every call fails, so a snapshot holding a secret can be neither written
/// nor read.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecretsCrypter;

#[async_trait]
impl Encrypter for NoSecretsCrypter {
    async fn encrypt_value(&self, _plaintext: &str) -> Result<String, SecretsError> {
        Err(SecretsError::NoSecretsProvider)
    }
}

#[async_trait]
impl Decrypter for NoSecretsCrypter {
    async fn decrypt_value(&self, _ciphertext: &str) -> Result<String, SecretsError> {
        Err(SecretsError::NoSecretsProvider)
    }
}

/// Crypter that replaces every secret with a fixed placeholder.
///
/// Used for display-only exports; it cannot decrypt.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlindingCrypter;

#[async_trait]
impl Encrypter for BlindingCrypter {
    async fn encrypt_value(&self, _plaintext: &str) -> Result<String, SecretsError> {
        Ok(BLINDED_SECRET.to_string())
    }
}

#[async_trait]
impl Decrypter for BlindingCrypter {
    async fn decrypt_value(&self, _ciphertext: &str) -> Result<String, SecretsError> {
        Err(SecretsError::DecryptFailed {
            message: "blinded secrets cannot be decrypted".to_string(),
        })
    }
}

fn is_secret_object(map: &Map<String, Value>) -> bool {
    map.get(SIGNATURE_KEY).and_then(Value::as_str) == Some(SECRET_SIGNATURE)
}

/// Visits every secret object in document order without descending into it.
fn visit_secrets(value: &Value, visit: &mut impl FnMut(&Map<String, Value>)) {
    match value {
        Value::Object(map) if is_secret_object(map) => visit(map),
        Value::Object(map) => {
            for item in map.values() {
                visit_secrets(item, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_secrets(item, visit);
            }
        }
        _ => {}
    }
}

fn visit_secrets_mut(value: &mut Value, visit: &mut impl FnMut(&mut Map<String, Value>)) {
    match value {
        Value::Object(map) if is_secret_object(map) => visit(map),
        Value::Object(map) => {
            for item in map.values_mut() {
                visit_secrets_mut(item, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_secrets_mut(item, visit);
            }
        }
        _ => {}
    }
}

/// Replaces every plaintext secret in `value` with its ciphertext.
///
/// Secrets that already carry a ciphertext are left alone.
///
/// # Errors
///
/// Returns the encrypter's error; `value` is untouched in that case.
pub async fn encrypt_secrets(value: &mut Value, encrypter: &dyn Encrypter) -> Result<(), SecretsError> {
    let mut plaintexts = Vec::new();
    visit_secrets(value, &mut |map: &Map<String, Value>| {
        if !map.contains_key("ciphertext") {
            if let Some(inner) = map.get("value") {
                plaintexts.push(inner.to_string());
            }
        }
    });
    if plaintexts.is_empty() {
        return Ok(());
    }

    debug!("Encrypting {} secret value(s)", plaintexts.len());
    let ciphertexts = encrypter.batch_encrypt(&plaintexts).await?;
    if ciphertexts.len() != plaintexts.len() {
        return Err(SecretsError::EncryptFailed {
            message: format!(
                "encrypter returned {} ciphertexts for {} plaintexts",
                ciphertexts.len(),
                plaintexts.len()
            ),
        });
    }

    let mut ciphertexts = ciphertexts.into_iter();
    visit_secrets_mut(value, &mut |map: &mut Map<String, Value>| {
        if !map.contains_key("ciphertext") && map.contains_key("value") {
            if let Some(ciphertext) = ciphertexts.next() {
                map.remove("value");
                map.insert("ciphertext".to_string(), Value::String(ciphertext));
            }
        }
    });
    Ok(())
}

/// Replaces every ciphertext secret in `value` with its plaintext.
///
/// # Errors
///
/// Returns the decrypter's error, or `DecryptFailed` if a plaintext is not
/// valid JSON.
pub async fn decrypt_secrets(value: &mut Value, decrypter: &dyn Decrypter) -> Result<(), SecretsError> {
    let ciphertexts = collect_ciphertexts(value)?;
    if ciphertexts.is_empty() {
        return Ok(());
    }

    debug!("Decrypting {} secret value(s)", ciphertexts.len());
    let plaintexts = decrypter.batch_decrypt(&ciphertexts).await?;
    let decoded = plaintexts
        .iter()
        .map(|plaintext| {
            serde_json::from_str::<Value>(plaintext).map_err(|e| SecretsError::DecryptFailed {
                message: format!("decrypted secret is not valid JSON: {e}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if decoded.len() != ciphertexts.len() {
        return Err(SecretsError::DecryptFailed {
            message: "decrypter returned the wrong number of plaintexts".to_string(),
        });
    }

    let mut decoded = decoded.into_iter();
    visit_secrets_mut(value, &mut |map: &mut Map<String, Value>| {
        if map.contains_key("ciphertext") {
            if let Some(plaintext) = decoded.next() {
                map.remove("ciphertext");
                map.insert("value".to_string(), plaintext);
            }
        }
    });
    Ok(())
}

/// Re-encrypts every ciphertext in `value` under a new encrypter.
///
/// Returns the number of secrets rotated.
///
/// # Errors
///
/// Returns the first decrypt or encrypt error; `value` is untouched then.
pub async fn reencrypt_secrets(
    value: &mut Value,
    decrypter: &dyn Decrypter,
    encrypter: &dyn Encrypter,
) -> Result<usize, SecretsError> {
    let ciphertexts = collect_ciphertexts(value)?;
    if ciphertexts.is_empty() {
        return Ok(0);
    }

    let plaintexts = decrypter.batch_decrypt(&ciphertexts).await?;
    let rotated = encrypter.batch_encrypt(&plaintexts).await?;
    if rotated.len() != ciphertexts.len() {
        return Err(SecretsError::EncryptFailed {
            message: "encrypter returned the wrong number of ciphertexts".to_string(),
        });
    }

    let count = rotated.len();
    let mut rotated = rotated.into_iter();
    visit_secrets_mut(value, &mut |map: &mut Map<String, Value>| {
        if map.contains_key("ciphertext") {
            if let Some(ciphertext) = rotated.next() {
                map.insert("ciphertext".to_string(), Value::String(ciphertext));
            }
        }
    });
    Ok(count)
}

fn collect_ciphertexts(value: &Value) -> Result<Vec<String>, SecretsError> {
    let mut ciphertexts = Vec::new();
    let mut malformed = false;
    visit_secrets(value, &mut |map: &Map<String, Value>| match map.get("ciphertext") {
        Some(Value::String(ciphertext)) => ciphertexts.push(ciphertext.clone()),
        Some(_) => malformed = true,
        None => {}
    });
    if malformed {
        return Err(SecretsError::DecryptFailed {
            message: "secret ciphertext must be a string".to_string(),
        });
    }
    Ok(ciphertexts)
}
