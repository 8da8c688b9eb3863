// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client builders with a consistent User-Agent header.

/// SDK name stamped on payloads and the User-Agent.
pub const SDK_NAME: &str = "hyperengage-rust";
/// SDK version stamped on payloads and the User-Agent.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creates an async HTTP client builder with the standard SDK User-Agent.
///
/// # Example
/// ```ignore
/// let client = hyperengage_common_http::builder()
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// ```
pub fn builder() -> reqwest::ClientBuilder {
	reqwest::Client::builder().user_agent(user_agent())
}

/// Creates a blocking HTTP client builder with the standard SDK User-Agent.
///
/// Blocking clients are for best-effort delivery when no async runtime is
/// available, such as a process-exit flush.
pub fn blocking_builder() -> reqwest::blocking::ClientBuilder {
	reqwest::blocking::Client::builder().user_agent(user_agent())
}

/// Returns the SDK User-Agent string.
///
/// Format: `hyperengage-rust/{version}`
pub fn user_agent() -> String {
	format!("{SDK_NAME}/{SDK_VERSION}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_user_agent_has_correct_format() {
		let ua = user_agent();
		let parts: Vec<&str> = ua.split('/').collect();
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0], SDK_NAME);
		assert_eq!(parts[1], SDK_VERSION);
	}

	#[test]
	fn test_async_builder_builds() {
		assert!(builder().build().is_ok());
	}
}
