// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound used by [`ReplayableBody::buffer_default`].
pub const DEFAULT_MAX_REPLAY_BYTES: usize = 8 * 1024 * 1024;

/// Request body content that every attempt can read from the start.
///
/// A request may be sent several times, so its body cannot be a one-shot stream. Bodies are held
/// in memory as [`Bytes`]; replaying clones the handle, not the data. Streams are drained into a
/// buffer up front with an explicit size cap.
///
/// # Examples
///
/// ```
/// use ferry::ReplayableBody;
///
/// let body = ReplayableBody::from("{\"name\":\"ferry\"}");
///
/// assert_eq!(body.replay(), body.replay());
/// assert_eq!(body.len(), 16);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayableBody(Bytes);

impl ReplayableBody {
    /// Creates an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Drains `reader` into memory, failing if it yields more than `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::TooLarge`] if the stream exceeds `limit`, or [`BodyError::Io`] if
    /// reading fails.
    pub async fn buffer<R>(reader: R, limit: usize) -> Result<Self, BodyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = Vec::new();
        let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
        reader.take(cap).read_to_end(&mut buffer).await?;

        if buffer.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }

        Ok(Self(Bytes::from(buffer)))
    }

    /// Drains `reader` into memory with the [`DEFAULT_MAX_REPLAY_BYTES`] cap.
    ///
    /// # Errors
    ///
    /// See [`ReplayableBody::buffer`].
    pub async fn buffer_default<R>(reader: R) -> Result<Self, BodyError>
    where
        R: AsyncRead + Unpin,
    {
        Self::buffer(reader, DEFAULT_MAX_REPLAY_BYTES).await
    }

    /// Returns the content from the start.
    #[must_use]
    pub fn replay(&self) -> Bytes {
        self.0.clone()
    }

    /// Returns the content length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there is no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for ReplayableBody {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for ReplayableBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<String> for ReplayableBody {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<&'static str> for ReplayableBody {
    fn from(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for ReplayableBody {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

/// Failure to buffer a request body.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BodyError {
    /// The stream yielded more bytes than the limit allows.
    #[error("request body exceeds the replay limit of {limit} bytes")]
    TooLarge {
        /// The limit that was exceeded.
        limit: usize,
    },

    /// Reading the stream failed.
    #[error("failed to read request body")]
    Io(#[from] std::io::Error),
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_within_limit() {
        let body = ReplayableBody::buffer(&b"hello"[..], 5).await.unwrap();

        assert_eq!(body.replay(), Bytes::from_static(b"hello"));
        assert_eq!(body.replay(), body.replay());
    }

    #[tokio::test]
    async fn buffer_over_limit_fails() {
        let error = ReplayableBody::buffer(&b"hello!"[..], 5).await.unwrap_err();

        assert!(matches!(error, BodyError::TooLarge { limit: 5 }));
        assert_eq!(error.to_string(), "request body exceeds the replay limit of 5 bytes");
    }

    #[tokio::test]
    async fn buffer_default_accepts_empty_stream() {
        let body = ReplayableBody::buffer_default(&b""[..]).await.unwrap();
        assert!(body.is_empty());
    }
}
