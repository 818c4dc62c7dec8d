// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Proptest Strategies
//!
//! Reusable proptest strategies for property-based testing.

use proptest::prelude::*;

/// Arbitrary message bytes, including empty and multi-block lengths.
pub fn message_bytes_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..1024)
}

/// User ids as the server issues them: no dots.
pub fn user_id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9+\\-]{1,24}"
}

pub fn device_id_strategy() -> impl Strategy<Value = u32> {
    1u32..10_000
}

/// Device names of any length, including non-ASCII.
pub fn device_name_strategy() -> impl Strategy<Value = String> {
    "\\PC{0,80}"
}
