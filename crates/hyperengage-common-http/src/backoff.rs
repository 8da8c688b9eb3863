// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Exponential backoff for delivery retries.

use std::time::Duration;

/// Retry bounds for a single event.
///
/// `max_attempts` counts physical sends, so `1` means no retries at all.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub min_delay: Duration,
	pub max_delay: Duration,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 4,
			min_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(60),
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// Returns true if another send is allowed after `attempts` sends.
	pub fn allows_retry(&self, attempts: u32) -> bool {
		attempts < self.max_attempts
	}
}

/// Delay before the next send, given how many sends have already failed.
///
/// The first retry waits `min_delay`; every later retry doubles the wait
/// until it reaches `max_delay`. Jitter scales the delay by 0.5..1.5 and the
/// result is clamped back into `[min_delay, max_delay]`.
pub fn calculate_delay(cfg: &RetryConfig, failed_attempts: u32) -> Duration {
	let floor = cfg.min_delay;
	let ceiling = cfg.max_delay.max(floor);

	let exponent = failed_attempts.saturating_sub(1).min(31);
	let capped_delay = floor
		.checked_mul(1u32 << exponent)
		.map_or(ceiling, |delay| delay.min(ceiling));

	if !cfg.jitter {
		return capped_delay;
	}

	let jitter_factor = 0.5 + fastrand::f64();
	Duration::try_from_secs_f64(capped_delay.as_secs_f64() * jitter_factor)
		.unwrap_or(ceiling)
		.clamp(floor, ceiling)
}
