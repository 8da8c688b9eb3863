// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Redacting wrapper for the API and workspace keys.
//!
//! Keys are sent as request headers on every delivery. They must never show
//! up in logs, config dumps or persisted queue snapshots, so the wrapper
//! redacts `Debug`, `Display` and `Serialize`, and zeroizes on drop.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

/// The redaction placeholder used in all output.
pub const REDACTED: &str = "[REDACTED]";

/// A key that authenticates ingestion requests.
///
/// # Example
///
/// ```
/// use hyperengage_core::ApiKey;
///
/// let key = ApiKey::new("pk_live_abc");
/// assert_eq!(format!("{key}"), "[REDACTED]");
/// assert_eq!(key.expose(), "pk_live_abc");
/// ```
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct ApiKey(String);

impl ApiKey {
	pub fn new(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	/// Explicitly access the key value.
	pub fn expose(&self) -> &str {
		&self.0
	}

	/// Returns true if the key is empty or whitespace only.
	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ApiKey").field(&REDACTED).finish()
	}
}

impl fmt::Display for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl Serialize for ApiKey {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(REDACTED)
	}
}

impl<'de> Deserialize<'de> for ApiKey {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		String::deserialize(deserializer).map(ApiKey)
	}
}

impl From<String> for ApiKey {
	fn from(key: String) -> Self {
		Self(key)
	}
}

impl From<&str> for ApiKey {
	fn from(key: &str) -> Self {
		Self(key.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_debug_is_redacted() {
		let key = ApiKey::new("super-secret-key");
		let debug_output = format!("{key:?}");
		assert!(!debug_output.contains("super-secret-key"));
		assert_eq!(debug_output, "ApiKey(\"[REDACTED]\")");
	}

	#[test]
	fn test_serialize_is_redacted() {
		let key = ApiKey::new("super-secret-key");
		let json = serde_json::to_string(&key).unwrap();
		assert_eq!(json, "\"[REDACTED]\"");
	}

	#[test]
	fn test_deserialize_keeps_value() {
		let key: ApiKey = serde_json::from_str("\"pk_123\"").unwrap();
		assert_eq!(key.expose(), "pk_123");
	}

	#[test]
	fn test_blank_detection() {
		assert!(ApiKey::new("").is_blank());
		assert!(ApiKey::new("  ").is_blank());
		assert!(!ApiKey::new("k").is_blank());
	}

	proptest! {
		#[test]
		fn test_display_never_leaks(value in "[a-zA-Z0-9_]{4,40}") {
			let key = ApiKey::new(value.clone());
			let shown = format!("{}", key);
			prop_assert!(!shown.contains(&value));
			prop_assert_eq!(key.expose(), value.as_str());
		}
	}
}
