//! Immutable payload container.
//!
//! A [`Buffer`] carries the raw bytes of a message together with their ASCII
//! text view. Clones share both representations; nothing is re-decoded.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::EncodingError;

#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    bytes: Bytes,
    text: Result<Arc<str>, EncodingError>,
}

impl Buffer {
    /// Wraps `bytes`, failing if they are not ASCII.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, EncodingError> {
        let buffer = Self::from_raw(bytes);
        buffer.text()?;
        Ok(buffer)
    }

    /// Wraps `bytes` without rejecting non-ASCII content.
    ///
    /// Used for wire data (frames, socket reads) where binary content is
    /// expected. The text view degrades to `""` and [`Buffer::text`] reports
    /// the decode failure.
    pub fn from_raw(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let text = decode_ascii(&bytes);
        Self { bytes, text }
    }

    pub fn from_text(text: &str) -> Result<Self, EncodingError> {
        Self::from_bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Sentinel instance with no content.
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
            text: Ok(Arc::from("")),
        }
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// ASCII view of the content, or the decode failure.
    pub fn text(&self) -> Result<&str, EncodingError> {
        match &self.text {
            Ok(text) => Ok(&**text),
            Err(e) => Err(*e),
        }
    }

    /// Best-effort text view: `""` when the content is not ASCII.
    pub fn text_lossy(&self) -> &str {
        self.text().unwrap_or("")
    }

    #[inline]
    pub fn is_ascii(&self) -> bool {
        self.text.is_ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<&str> for Buffer {
    type Error = EncodingError;

    fn try_from(text: &str) -> Result<Self, Self::Error> {
        Self::from_text(text)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Ok(text) => f.debug_tuple("Buffer").field(text).finish(),
            Err(_) => write!(f, "Buffer(<{} binary bytes>)", self.bytes.len()),
        }
    }
}

fn decode_ascii(bytes: &[u8]) -> Result<Arc<str>, EncodingError> {
    match bytes.iter().position(|b| !b.is_ascii()) {
        Some(position) => Err(EncodingError {
            position,
            byte: bytes[position],
        }),
        // All bytes < 0x80, so the UTF-8 view is exact.
        None => Ok(Arc::from(String::from_utf8_lossy(bytes).as_ref())),
    }
}
