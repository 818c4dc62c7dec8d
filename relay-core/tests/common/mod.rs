// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common Test Utilities
//!
//! Shared fakes, fixtures and helpers used across test modules.
//! Each test binary only uses part of this module.

#![allow(dead_code)]

pub mod fakes;
pub mod fixtures;
pub mod helpers;
pub mod strategies;
