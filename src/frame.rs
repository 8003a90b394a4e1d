//! Output frames handed to the downstream consumer.

use std::{fmt, time::Duration};

use bytes::Bytes;

/// Identifier of the peer that sent a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl From<u64> for ClientId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ClientId {
    /// Create a new [`ClientId`] with the provided value.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ClientId({})", self.0) }
}

/// One reassembled unit: ordered memory segments tagged with their sender.
///
/// Consumers route responses back to the sender through
/// [`client_id`](Self::client_id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    segments: Vec<Bytes>,
    client_id: ClientId,
    pts: Option<Duration>,
}

impl Frame {
    #[must_use]
    pub fn new(segments: Vec<Bytes>, client_id: ClientId) -> Self {
        Self {
            segments,
            client_id,
            pts: None,
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Bytes] { &self.segments }

    #[must_use]
    pub fn client_id(&self) -> ClientId { self.client_id }

    /// Running time at which the frame was produced, if stamped.
    #[must_use]
    pub fn pts(&self) -> Option<Duration> { self.pts }

    pub(crate) fn set_pts(&mut self, pts: Duration) { self.pts = Some(pts); }

    /// Total payload size across all segments.
    #[must_use]
    pub fn len(&self) -> usize { self.segments.iter().map(Bytes::len).sum() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.segments.iter().all(Bytes::is_empty) }

    /// Consume the frame, returning its segments.
    #[must_use]
    pub fn into_segments(self) -> Vec<Bytes> { self.segments }
}
