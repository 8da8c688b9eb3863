// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for the Hyperengage SDK.
//!
//! This crate provides:
//! - Pre-configured async and blocking HTTP client builders with a consistent
//!   User-Agent header
//! - Exponential backoff bounded by a floor and a ceiling

mod backoff;
mod client;

pub use backoff::{calculate_delay, RetryConfig};
pub use client::{blocking_builder, builder, user_agent, SDK_NAME, SDK_VERSION};
