// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Socket frames are either a request or a response. Each frame is a JSON
//! document preceded by a 4-byte big-endian length header.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use super::error::NetworkError;

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame body accepted.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Request carried over the socket, in either direction.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub verb: String,
    pub path: String,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Response to a [`WireRequest`] with the same id.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    pub status: u16,
    pub message: String,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single socket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    Request(WireRequest),
    Response(WireResponse),
}

/// Writes the length prefix for a body of `len` bytes.
pub fn write_frame_length(len: usize) -> [u8; FRAME_HEADER_SIZE] {
    (len as u32).to_be_bytes()
}

/// Reads the length prefix.
pub fn read_frame_length(header: &[u8; FRAME_HEADER_SIZE]) -> usize {
    u32::from_be_bytes(*header) as usize
}

/// Serializes a frame with its length prefix.
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, NetworkError> {
    let body =
        serde_json::to_vec(message).map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::InvalidMessage(format!(
            "Frame too large: {} bytes",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&write_frame_length(body.len()));
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a length-prefixed frame.
pub fn decode_message(frame: &[u8]) -> Result<WireMessage, NetworkError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(NetworkError::InvalidMessage("Frame too short".into()));
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
    let expected = read_frame_length(&header);
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() != expected {
        return Err(NetworkError::InvalidMessage(format!(
            "Length mismatch: expected {}, got {}",
            expected,
            body.len()
        )));
    }
    serde_json::from_slice(body).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
}
