//! Messages received from a transport.
//!
//! A message is an ordered list of raw segments plus a string-keyed info
//! map. Transports hand messages over as [`BoxedMessage`]; the frame
//! assembler is the only consumer and drops each message after one attempt.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;

/// Info key carrying the originating client's id.
pub const CLIENT_ID_KEY: &str = "client_id";

/// Errors raised while reading a message.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The message could not report how many segments it holds.
    #[error("segment count unavailable")]
    CountUnavailable,
    /// The requested segment does not exist.
    #[error("segment {index} out of range; message holds {count}")]
    OutOfRange {
        /// Index that was requested.
        index: usize,
        /// Number of segments held.
        count: usize,
    },
    /// The segment exists but its payload cannot be read.
    #[error("segment {0} is unreadable")]
    Unreadable(usize),
}

/// Read access to a received message.
pub trait EdgeMessage: Send + 'static {
    /// Number of segments in the message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::CountUnavailable`] if the count cannot be read.
    fn segment_count(&self) -> Result<usize, MessageError>;

    /// Borrow the payload of segment `index`.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] if the segment cannot be read.
    fn segment(&self, index: usize) -> Result<&[u8], MessageError>;

    /// Look up an info value.
    fn info(&self, key: &str) -> Option<String>;
}

/// Owned message as delivered by a transport callback.
pub type BoxedMessage = Box<dyn EdgeMessage>;

/// Owned message implementation used by the bundled transports.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeData {
    segments: Vec<Bytes>,
    info: HashMap<String, String>,
}

impl EdgeData {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a segment, keeping arrival order.
    pub fn push_segment(&mut self, segment: impl Into<Bytes>) { self.segments.push(segment.into()); }

    /// Set an info value, replacing any previous one.
    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`push_segment`](Self::push_segment).
    #[must_use]
    pub fn with_segment(mut self, segment: impl Into<Bytes>) -> Self {
        self.push_segment(segment);
        self
    }

    /// Builder-style variant of [`set_info`](Self::set_info).
    #[must_use]
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_info(key, value);
        self
    }

    #[must_use]
    pub fn segments(&self) -> &[Bytes] { &self.segments }

    #[must_use]
    pub fn into_boxed(self) -> BoxedMessage { Box::new(self) }
}

impl EdgeMessage for EdgeData {
    fn segment_count(&self) -> Result<usize, MessageError> { Ok(self.segments.len()) }

    fn segment(&self, index: usize) -> Result<&[u8], MessageError> {
        self.segments
            .get(index)
            .map(AsRef::as_ref)
            .ok_or(MessageError::OutOfRange {
                index,
                count: self.segments.len(),
            })
    }

    fn info(&self, key: &str) -> Option<String> { self.info.get(key).cloned() }
}
