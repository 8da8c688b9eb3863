// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the tracking SDK.
//!
//! Delivery failures are deliberately absent: a tracking call never fails
//! because the network did. Those show up in [`crate::DeliveryOutcome`] and
//! in logs instead.

use hyperengage_core::CoreError;
use thiserror::Error;

/// Tracking SDK errors.
#[derive(Debug, Error)]
pub enum HyperengageError {
	/// API key is missing or blank.
	#[error("missing API key")]
	MissingKey,

	/// Workspace key is missing or blank.
	#[error("missing workspace key")]
	MissingWorkspaceKey,

	/// Tracking host is missing or not an absolute http(s) URL.
	#[error("invalid tracking host: {0}")]
	InvalidTrackingHost(String),

	/// A configuration value is out of range.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// Building the HTTP client failed.
	#[error("HTTP client setup failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,

	/// A tracking call had malformed arguments.
	#[error("validation failed: {0}")]
	ValidationFailed(String),

	/// Properties or traits could not be encoded as a JSON object.
	#[error("serialization error: {0}")]
	Serialization(String),

	/// Storage or other core failure.
	#[error(transparent)]
	Core(#[from] CoreError),
}

impl From<serde_json::Error> for HyperengageError {
	fn from(err: serde_json::Error) -> Self {
		HyperengageError::Serialization(err.to_string())
	}
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, HyperengageError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_configuration_errors_have_readable_messages() {
		assert_eq!(HyperengageError::MissingKey.to_string(), "missing API key");
		assert_eq!(
			HyperengageError::InvalidTrackingHost("ftp://x".to_string()).to_string(),
			"invalid tracking host: ftp://x"
		);
	}

	#[test]
	fn test_serde_errors_become_serialization_errors() {
		let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
		let err: HyperengageError = err.into();
		assert!(matches!(err, HyperengageError::Serialization(_)));
	}

	#[test]
	fn test_core_errors_are_transparent() {
		let err: HyperengageError = CoreError::InvalidStorageKey("../x".to_string()).into();
		assert_eq!(err.to_string(), "invalid storage key: ../x");
	}
}
