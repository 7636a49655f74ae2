//! Persisted snapshot format.
//!
//! A snapshot is stored as a versioned envelope:
//!
//! ```json
//! { "version": 1, "checksum": "<sha256 hex>", "deployment": { ... } }
//! ```
//!
//! The checksum covers the canonical (key-sorted, compact) JSON encoding of
//! `deployment`, after secrets have been encrypted. Unknown fields inside
//! `deployment` are preserved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::types::Snapshot;
use crate::error::{Result, StateError};
use crate::secrets::{self, Decrypter, Encrypter};

/// Current persisted format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// The persisted form of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    /// Format version.
    pub version: u32,
    /// Hex SHA-256 of the canonical deployment JSON.
    #[serde(default)]
    pub checksum: String,
    /// The snapshot with secrets encrypted.
    pub deployment: Value,
}

impl SnapshotDocument {
    /// Encodes a snapshot under the given revision, encrypting every secret.
    ///
    /// # Errors
    ///
    /// Returns a serialization error or the encrypter's error.
    pub async fn encode(snapshot: &Snapshot, revision: u64, encrypter: &dyn Encrypter) -> Result<Self> {
        let mut deployment = serde_json::to_value(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot: {e}")))?;
        if let Value::Object(map) = &mut deployment {
            map.insert("revision".to_string(), Value::from(revision));
        }

        secrets::encrypt_secrets(&mut deployment, encrypter).await?;

        let checksum = checksum(&deployment)?;
        Ok(Self {
            version: SNAPSHOT_FORMAT_VERSION,
            checksum,
            deployment,
        })
    }

    /// Verifies the envelope and decodes the snapshot, decrypting secrets.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for a newer format,
    /// [`StateError::Corrupted`] on checksum mismatch or malformed content,
    /// or the decrypter's error.
    pub async fn decode(&self, decrypter: &dyn Decrypter) -> Result<Snapshot> {
        self.verify()?;

        let mut deployment = self.deployment.clone();
        secrets::decrypt_secrets(&mut deployment, decrypter).await?;

        let snapshot: Snapshot = serde_json::from_value(deployment)
            .map_err(|e| StateError::corrupted(format!("Failed to decode snapshot: {e}")))?;
        debug!(
            "Decoded snapshot revision {} with {} resource(s)",
            snapshot.revision,
            snapshot.resources.len()
        );
        Ok(snapshot)
    }

    /// Checks the format version and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] or [`StateError::Corrupted`].
    pub fn verify(&self) -> Result<()> {
        if self.version > SNAPSHOT_FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: self.version,
            }
            .into());
        }
        // An empty checksum is accepted for hand-written documents.
        if !self.checksum.is_empty() {
            let actual = checksum(&self.deployment)?;
            if actual != self.checksum {
                return Err(StateError::corrupted(format!(
                    "checksum mismatch: recorded {}, computed {actual}",
                    self.checksum
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Returns the stored revision without decoding the snapshot.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.deployment
            .get("revision")
            .and_then(Value::as_u64)
            .unwrap_or_default()
    }

    /// Re-encrypts every secret under a new encrypter.
    ///
    /// Nothing but ciphertexts and the checksum change. Returns the number
    /// of secrets rotated.
    ///
    /// # Errors
    ///
    /// Returns the decrypt or encrypt error; the document is unchanged then.
    pub async fn rotate_secrets(
        &mut self,
        decrypter: &dyn Decrypter,
        encrypter: &dyn Encrypter,
    ) -> Result<usize> {
        self.verify()?;
        let mut deployment = self.deployment.clone();
        let rotated = secrets::reencrypt_secrets(&mut deployment, decrypter, encrypter).await?;
        self.checksum = checksum(&deployment)?;
        self.deployment = deployment;
        debug!("Rotated {} secret(s)", rotated);
        Ok(rotated)
    }

    /// Serializes the document for storage.
    ///
    /// # Errors
    ///
    /// Returns a serialization error.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize snapshot document: {e}")).into())
    }

    /// Parses a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if the bytes are not a document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse snapshot document: {e}")).into())
    }
}

/// Computes the hex SHA-256 of the canonical JSON encoding of `value`.
fn checksum(value: &Value) -> Result<String> {
    // serde_json maps are key-sorted, so compact output is canonical.
    let canonical = serde_json::to_vec(value)
        .map_err(|e| StateError::serialization(format!("Failed to encode snapshot: {e}")))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
