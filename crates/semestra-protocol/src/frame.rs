// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for TCP stream framing.
//!
//! Each frame carries exactly one [`Message`] with the following layout:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: UTF-8 JSON payload
//!
//! A peer closing the socket between frames is a clean disconnect
//! ([`FrameError::ConnectionClosed`]); a zero or oversized length prefix is a
//! fatal protocol error that terminates the connection.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Message;

/// Maximum frame payload size (8 MB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Frame header size (4 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Encode a message to its on-wire bytes (header + JSON payload).
pub fn encode(message: &Message) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put(payload.as_slice());
    Ok(buf.freeze())
}

/// Decode a message from a complete payload (header already stripped).
pub fn decode(payload: &[u8]) -> Result<Message, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Write one framed message to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), FrameError> {
    let encoded = encode(message)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async reader.
///
/// Returns [`FrameError::ConnectionClosed`] when the peer closed the stream
/// before the length prefix; EOF in the middle of a frame is an IO error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header);
    if length == 0 {
        return Err(FrameError::InvalidLength(length));
    }
    if length as usize > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length as usize));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    decode(&payload)
}
