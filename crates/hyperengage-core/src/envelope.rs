// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The event envelope: the unit of delivery.
//!
//! An envelope is built once per tracking call by the client and is never
//! mutated afterwards. The delivery queue owns it until it is delivered or
//! dropped.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::context::PageContext;

/// Unique identifier for an envelope.
///
/// Uses UUIDv7 so ids sort by creation time, which keeps rehydrated queues
/// in roughly the order they were captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		let uuid7_val = uuid7::uuid7();
		Self(Uuid::from_bytes(*uuid7_val.as_bytes()))
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// The kind of event carried by an envelope.
///
/// Serialized as a bare string. Unknown strings round-trip through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
	PageView,
	Track,
	UserIdentify,
	AccountIdentify,
	Custom(String),
}

impl EventType {
	pub fn as_str(&self) -> &str {
		match self {
			EventType::PageView => "page_view",
			EventType::Track => "track",
			EventType::UserIdentify => "user_identify",
			EventType::AccountIdentify => "account_identify",
			EventType::Custom(name) => name,
		}
	}

	/// Identify events carry `traits`; everything else carries `properties`.
	pub fn is_identify(&self) -> bool {
		matches!(self, EventType::UserIdentify | EventType::AccountIdentify)
	}
}

impl From<&str> for EventType {
	fn from(name: &str) -> Self {
		match name {
			"page_view" | "pageview" => EventType::PageView,
			"track" => EventType::Track,
			"user_identify" => EventType::UserIdentify,
			"account_identify" => EventType::AccountIdentify,
			other => EventType::Custom(other.to_string()),
		}
	}
}

impl From<String> for EventType {
	fn from(name: String) -> Self {
		match EventType::from(name.as_str()) {
			EventType::Custom(_) => EventType::Custom(name),
			known => known,
		}
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for EventType {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for EventType {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		String::deserialize(deserializer).map(EventType::from)
	}
}

/// A single tracking event as it is sent to the ingestion endpoint.
///
/// # Example
///
/// ```
/// use hyperengage_core::{EventEnvelope, EventType};
///
/// let envelope = EventEnvelope::new(EventType::PageView, "anon_123")
///     .with_user_id(Some("user_1".to_string()))
///     .with_properties(serde_json::json!({"plan": "pro"}));
///
/// assert_eq!(envelope.event_type.as_str(), "page_view");
/// assert_eq!(envelope.doc_search, "");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub event_id: EventId,
	pub event_type: EventType,
	pub anonymous_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub account_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub properties: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub traits: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub doc_host: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub doc_path: Option<String>,
	#[serde(default)]
	pub doc_search: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub referer: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
	#[serde(default)]
	pub utm: BTreeMap<String, String>,
	#[serde(default)]
	pub click_id: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub src: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lib_version: Option<String>,
	pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
	/// Creates an envelope with a fresh id and the current time.
	pub fn new(event_type: EventType, anonymous_id: impl Into<String>) -> Self {
		Self {
			event_id: EventId::new(),
			event_type,
			anonymous_id: anonymous_id.into(),
			user_id: None,
			account_id: None,
			properties: None,
			traits: None,
			url: None,
			doc_host: None,
			doc_path: None,
			doc_search: String::new(),
			referer: None,
			user_agent: None,
			utm: BTreeMap::new(),
			click_id: BTreeMap::new(),
			src: None,
			lib_version: None,
			timestamp: Utc::now(),
		}
	}

	pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
		self.user_id = user_id;
		self
	}

	pub fn with_account_id(mut self, account_id: Option<String>) -> Self {
		self.account_id = account_id;
		self
	}

	/// Sets the event payload.
	///
	/// Identify events store it under `traits`, all other events under
	/// `properties`.
	pub fn with_payload(self, payload: serde_json::Value) -> Self {
		if self.event_type.is_identify() {
			self.with_traits(payload)
		} else {
			self.with_properties(payload)
		}
	}

	pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
		self.properties = Some(properties);
		self
	}

	pub fn with_traits(mut self, traits: serde_json::Value) -> Self {
		self.traits = Some(traits);
		self
	}

	/// Copies page context fields onto the envelope.
	pub fn with_context(mut self, context: PageContext) -> Self {
		self.url = Some(context.url);
		self.doc_host = context.doc_host;
		self.doc_path = Some(context.doc_path);
		self.doc_search = context.doc_search;
		self.referer = context.referer;
		self.user_agent = context.user_agent;
		self.utm = context.utm;
		self.click_id = context.click_id;
		self
	}

	/// Stamps the SDK name and version.
	pub fn with_source(mut self, src: impl Into<String>, lib_version: impl Into<String>) -> Self {
		self.src = Some(src.into());
		self.lib_version = Some(lib_version.into());
		self
	}
}
