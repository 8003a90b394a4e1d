//! Conversion of received messages into frames.
//!
//! [`assemble`] copies every segment of a message into an owned buffer,
//! in order, and tags the result with the sender's id taken from the
//! message's `client_id` info entry. Any failure discards the whole frame;
//! the message is destroyed either way.

use bytes::Bytes;
use log::error;
use thiserror::Error;

use crate::{
    frame::{ClientId, Frame},
    message::{BoxedMessage, CLIENT_ID_KEY, EdgeMessage, MessageError},
};


/// Reasons a message produced no frame.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameAssemblyError {
    /// The message could not report its segment count.
    #[error("failed to read segment count: {0}")]
    SegmentCount(#[source] MessageError),
    /// A segment could not be copied.
    #[error("failed to copy segment {index}: {source}")]
    SegmentCopy {
        /// Index of the failing segment.
        index: usize,
        /// Underlying message error.
        #[source]
        source: MessageError,
    },
    /// The message carried no client id.
    #[error("message has no client_id")]
    MissingClientId,
    /// The client id was not an unsigned integer.
    #[error("client_id {0:?} is not an unsigned integer")]
    InvalidClientId(String),
}

/// Turn `message` into a [`Frame`], consuming it.
///
/// # Errors
///
/// Returns a [`FrameAssemblyError`] when the segment count or any segment
/// cannot be read, or when the client id is absent or unparseable. No
/// partial frame is ever returned.
pub fn assemble(message: BoxedMessage) -> Result<Frame, FrameAssemblyError> {
    let result = build_frame(message.as_ref());
    drop(message);
    if let Err(e) = &result {
        error!("failed to assemble frame: error={e}");
    }
    result
}

fn build_frame(message: &dyn EdgeMessage) -> Result<Frame, FrameAssemblyError> {
    let count = message
        .segment_count()
        .map_err(FrameAssemblyError::SegmentCount)?;

    let mut segments = Vec::with_capacity(count);
    for index in 0..count {
        let payload = message
            .segment(index)
            .map_err(|source| FrameAssemblyError::SegmentCopy { index, source })?;
        segments.push(Bytes::copy_from_slice(payload));
    }

    let client_id = parse_client_id(message.info(CLIENT_ID_KEY))?;
    Ok(Frame::new(segments, client_id))
}

fn parse_client_id(value: Option<String>) -> Result<ClientId, FrameAssemblyError> {
    let value = value.ok_or(FrameAssemblyError::MissingClientId)?;
    value
        .trim()
        .parse::<u64>()
        .map(ClientId::from)
        .map_err(|_| FrameAssemblyError::InvalidClientId(value))
}
