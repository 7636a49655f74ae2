//! Wire framing for out-of-process provider plugins.
//!
//! Each message is a JSON document preceded by its length:
//!
//! ```text
//! +----------------+---------------------+
//! | len: u32 (BE)  | JSON payload (len)  |
//! +----------------+---------------------+
//! ```
//!
//! The engine writes [`RequestFrame`]s to the plugin's stdin and reads
//! [`ResponseFrame`]s from its stdout. Responses may arrive in any order and
//! are matched to requests by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProviderError;
use crate::resource::{PropertyMap, Urn};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum payload size (64 MB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A capability call sent to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique per plugin process.
    pub id: u64,
    /// Capability name: `info`, `configure`, `check`, `diff`, `create`,
    /// `update`, `delete`, `read`, `invoke` or `shutdown`.
    pub method: String,
    /// Capability request body.
    #[serde(default)]
    pub params: Value,
}

/// A plugin's answer to one [`RequestFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request being answered.
    pub id: u64,
    /// Capability response body on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

impl ResponseFrame {
    /// A successful response.
    #[must_use]
    pub const fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub const fn err(id: u64, error: ErrorFrame) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Failure reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorFrame {
    /// The call failed.
    Failure {
        /// Error message.
        message: String,
        /// The failure is transient.
        #[serde(default)]
        retryable: bool,
    },
    /// The plugin does not implement the capability.
    Unsupported,
    /// A create or update changed infrastructure but did not finish.
    Partial {
        /// Resource the call was for.
        urn: Urn,
        /// Physical id, if one was assigned.
        #[serde(default)]
        id: Option<String>,
        /// Outputs known so far.
        #[serde(default)]
        outputs: PropertyMap,
        /// What did not finish.
        #[serde(default)]
        reasons: Vec<String>,
    },
}

impl ErrorFrame {
    /// Converts the frame into the engine's error for `operation`.
    #[must_use]
    pub fn into_error(self, package: &str, operation: &'static str) -> ProviderError {
        match self {
            Self::Failure { message, retryable } => ProviderError::Failure {
                package: package.to_string(),
                message,
                retryable,
            },
            Self::Unsupported => ProviderError::Unsupported {
                package: package.to_string(),
                operation,
            },
            Self::Partial {
                urn,
                id,
                outputs,
                reasons,
            } => ProviderError::Partial {
                package: package.to_string(),
                urn,
                id,
                outputs,
                reasons,
            },
        }
    }
}

/// Writes one length-prefixed frame and flushes.
///
/// # Errors
///
/// Returns an error if the payload is too large or the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Frame too large: {} bytes", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame length overflow"))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` if the stream ended cleanly before a new header.
///
/// # Errors
///
/// Returns an error if the frame is oversized or the stream ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serializes `frame` as JSON and writes it.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_json<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_survive_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let request = RequestFrame {
            id: 7,
            method: "check".to_string(),
            params: json!({"news": {"size": 3}}),
        };
        let writer = tokio::spawn(async move {
            write_json(&mut client, &request).await.expect("write");
            write_frame(&mut client, b"{}").await.expect("write");
        });

        let first = read_frame(&mut server).await.expect("read").expect("frame");
        let decoded: RequestFrame = serde_json::from_slice(&first).expect("decode");
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method, "check");

        let second = read_frame(&mut server).await.expect("read").expect("frame");
        assert_eq!(second, b"{}");

        writer.await.expect("join");
        assert!(read_frame(&mut server).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = u32::try_from(MAX_FRAME_SIZE + 1).unwrap();
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }

    #[test]
    fn test_error_frames_map_to_provider_errors() {
        let frame: ErrorFrame =
            serde_json::from_value(json!({"kind": "failure", "message": "throttled", "retryable": true}))
                .unwrap();
        assert!(frame.into_error("aws", "create").is_retryable());

        let unsupported: ErrorFrame = serde_json::from_value(json!({"kind": "unsupported"})).unwrap();
        assert!(matches!(
            unsupported.into_error("aws", "diff"),
            ProviderError::Unsupported { operation: "diff", .. }
        ));
    }
}
