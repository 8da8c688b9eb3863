// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event properties and identity traits.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{HyperengageError, Result};

/// An opaque JSON object attached to an event as `properties` or `traits`.
///
/// # Example
///
/// ```
/// use hyperengage::Properties;
///
/// let props = Properties::new()
///     .insert("plan", "pro")
///     .insert("seats", 12);
/// assert_eq!(props.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
	inner: Map<String, Value>,
}

impl Properties {
	pub fn new() -> Self {
		Self { inner: Map::new() }
	}

	/// Builds properties from any serializable value that encodes as a JSON
	/// object, such as a struct or a string-keyed map.
	///
	/// Fails for values that are not objects or cannot be encoded (for
	/// instance maps with non-string keys).
	pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
		Self::try_from(serde_json::to_value(value)?)
	}

	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	/// Merges `other` into these properties; `other` wins on conflicts.
	pub fn merge(mut self, other: Properties) -> Self {
		self.inner.extend(other.inner);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.inner.get(key)
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.inner)
	}
}

impl From<Properties> for Value {
	fn from(props: Properties) -> Self {
		props.into_value()
	}
}

impl From<Map<String, Value>> for Properties {
	fn from(map: Map<String, Value>) -> Self {
		Self { inner: map }
	}
}

impl TryFrom<Value> for Properties {
	type Error = HyperengageError;

	fn try_from(value: Value) -> Result<Self> {
		match value {
			Value::Object(map) => Ok(Self { inner: map }),
			Value::Null => Ok(Self::new()),
			other => Err(HyperengageError::Serialization(format!(
				"expected a JSON object, got {}",
				json_kind(&other)
			))),
		}
	}
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Array(_) => "an array",
		Value::Object(_) => "an object",
	}
}
