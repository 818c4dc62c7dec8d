// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Plaintext Padding
//!
//! Pads message plaintext to a multiple of [`PADDING_BLOCK`] bytes so the
//! ciphertext length only reveals a coarse size class. Layout is
//! `message | 0x80 | 0x00*`.

use thiserror::Error;

/// Padded plaintexts are always a multiple of this many bytes.
pub const PADDING_BLOCK: usize = 160;

const TERMINATOR: u8 = 0x80;

/// Padding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaddingError {
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("missing terminator")]
    MissingTerminator,
}

/// Length of the padded form of a `len`-byte message.
pub fn padded_length(len: usize) -> usize {
    (len + 1).div_ceil(PADDING_BLOCK) * PADDING_BLOCK
}

/// Pads `message` with a terminator and zero fill.
pub fn pad(message: &[u8]) -> Vec<u8> {
    let mut padded = vec![0u8; padded_length(message.len())];
    padded[..message.len()].copy_from_slice(message);
    padded[message.len()] = TERMINATOR;
    padded
}

/// Strips zero fill and the terminator, returning the original message.
pub fn unpad(padded: &[u8]) -> Result<&[u8], PaddingError> {
    for (offset, &byte) in padded.iter().enumerate().rev() {
        match byte {
            0x00 => continue,
            TERMINATOR => return Ok(&padded[..offset]),
            byte => return Err(PaddingError::UnexpectedByte { byte, offset }),
        }
    }
    Err(PaddingError::MissingTerminator)
}
