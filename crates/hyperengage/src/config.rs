// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.
//!
//! [`ClientConfig`] is the validated form the client runs with. It is
//! produced by [`crate::HyperengageClientBuilder::build`], which can be fed
//! from code, from a deserialized [`ClientOptions`], or from the process
//! environment via [`ClientOptions::from_env`].
//!
//! Environment variables:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `HYPERENGAGE_KEY` / `HYPERENGAGE_KEY_FILE` | API key |
//! | `HYPERENGAGE_WORKSPACE_KEY` / `HYPERENGAGE_WORKSPACE_KEY_FILE` | Workspace key |
//! | `HYPERENGAGE_TRACKING_HOST` | Base URL of the ingestion service |
//! | `HYPERENGAGE_INGESTION_PATH` | Path appended to the host |
//! | `HYPERENGAGE_MAX_SEND_ATTEMPTS` | Physical sends per event |
//! | `HYPERENGAGE_MIN_SEND_TIMEOUT_MS` | First retry delay |
//! | `HYPERENGAGE_MAX_SEND_TIMEOUT_MS` | Retry delay ceiling |
//! | `HYPERENGAGE_REQUEST_TIMEOUT_MS` | Per-send timeout |
//! | `HYPERENGAGE_DISABLE_EVENT_PERSISTENCE` | Skip the queue snapshot |
//! | `HYPERENGAGE_USE_BEACON_API` | Use the synchronous transport |
//! | `HYPERENGAGE_COOKIE_NAME` / `HYPERENGAGE_COOKIE_DOMAIN` | Identity scope |
//! | `HYPERENGAGE_COOKIE_POLICY` / `HYPERENGAGE_PRIVACY_POLICY` | `keep` or `strict` |
//! | `HYPERENGAGE_STORAGE_DIR` | Directory for the file-backed store |

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hyperengage_common_http::RetryConfig;
use hyperengage_core::{ApiKey, IdentityScope};
use serde::Deserialize;

use crate::error::{HyperengageError, Result};

/// Default path of the ingestion endpoint, relative to the tracking host.
pub const DEFAULT_INGESTION_PATH: &str = "/api/v1/event";

/// Storage key for the persisted delivery queue.
pub const EVENT_QUEUE_KEY: &str = "__hyperengage_event_queue";

/// Default per-send timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_PREFIX: &str = "HYPERENGAGE_";

/// Produces extra headers for a send. Called once per physical send.
pub type HeaderProvider = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

/// Validated client configuration.
#[derive(Clone)]
pub struct ClientConfig {
	/// Tracking host without a trailing slash.
	pub tracking_host: String,
	pub key: ApiKey,
	pub workspace_key: ApiKey,
	pub ingestion_path: String,
	pub retry: RetryConfig,
	pub request_timeout: Duration,
	pub custom_headers: Option<HeaderProvider>,
	pub disable_event_persistence: bool,
	pub persist_identity: bool,
	pub use_beacon_api: bool,
	pub identity_scope: IdentityScope,
}

impl ClientConfig {
	/// Full ingestion URL.
	pub fn endpoint(&self) -> String {
		format!("{}{}", self.tracking_host, self.ingestion_path)
	}
}

impl fmt::Debug for ClientConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientConfig")
			.field("tracking_host", &self.tracking_host)
			.field("key", &self.key)
			.field("workspace_key", &self.workspace_key)
			.field("ingestion_path", &self.ingestion_path)
			.field("retry", &self.retry)
			.field("request_timeout", &self.request_timeout)
			.field("custom_headers", &self.custom_headers.is_some())
			.field("disable_event_persistence", &self.disable_event_persistence)
			.field("persist_identity", &self.persist_identity)
			.field("use_beacon_api", &self.use_beacon_api)
			.field("identity_scope", &self.identity_scope)
			.finish()
	}
}

/// Whether the SDK may keep identifiers on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyPolicy {
	/// Persist the anonymous id in the store.
	#[default]
	Keep,
	/// Keep the anonymous id in memory only.
	Strict,
}

impl FromStr for PrivacyPolicy {
	type Err = HyperengageError;

	fn from_str(value: &str) -> Result<Self> {
		match value.to_ascii_lowercase().as_str() {
			"keep" => Ok(PrivacyPolicy::Keep),
			"strict" => Ok(PrivacyPolicy::Strict),
			other => Err(HyperengageError::InvalidConfig(format!(
				"unknown privacy policy {other:?}, expected keep or strict"
			))),
		}
	}
}

/// Unvalidated options, as they appear in a config file or the environment.
///
/// Timeouts are in milliseconds. Unset fields keep the builder's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClientOptions {
	pub key: Option<ApiKey>,
	pub workspace_key: Option<ApiKey>,
	pub tracking_host: Option<String>,
	pub ingestion_path: Option<String>,
	pub max_send_attempts: Option<u32>,
	pub min_send_timeout: Option<u64>,
	pub max_send_timeout: Option<u64>,
	pub request_timeout: Option<u64>,
	pub disable_event_persistence: Option<bool>,
	pub use_beacon_api: Option<bool>,
	pub cookie_name: Option<String>,
	pub cookie_domain: Option<String>,
	pub cookie_policy: Option<PrivacyPolicy>,
	pub privacy_policy: Option<PrivacyPolicy>,
	/// Opens a [`hyperengage_core::FileStore`] here unless a store is given
	/// to the builder.
	pub storage_dir: Option<PathBuf>,
}

impl ClientOptions {
	/// Whether the policies allow persisting the anonymous id. `None` when
	/// neither policy is set. `strict` in either one wins.
	pub fn persist_identity(&self) -> Option<bool> {
		if self.cookie_policy.is_none() && self.privacy_policy.is_none() {
			return None;
		}
		let strict = [self.cookie_policy, self.privacy_policy].contains(&Some(PrivacyPolicy::Strict));
		Some(!strict)
	}

	/// Reads `HYPERENGAGE_*` variables from the process environment.
	///
	/// Keys may instead be given as a path in `<VAR>_FILE`; the file content
	/// is trimmed. Setting both the variable and its `_FILE` twin is an error.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Same as [`ClientOptions::from_env`] with a custom variable source.
	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |name: &str| {
			lookup(&format!("{ENV_PREFIX}{name}"))
				.map(|v| v.trim().to_string())
				.filter(|v| !v.is_empty())
		};

		Ok(Self {
			key: load_secret(&lookup, "KEY")?,
			workspace_key: load_secret(&lookup, "WORKSPACE_KEY")?,
			tracking_host: var("TRACKING_HOST"),
			ingestion_path: var("INGESTION_PATH"),
			max_send_attempts: var("MAX_SEND_ATTEMPTS")
				.map(|v| parse_number("MAX_SEND_ATTEMPTS", &v))
				.transpose()?,
			min_send_timeout: var("MIN_SEND_TIMEOUT_MS")
				.map(|v| parse_number("MIN_SEND_TIMEOUT_MS", &v))
				.transpose()?,
			max_send_timeout: var("MAX_SEND_TIMEOUT_MS")
				.map(|v| parse_number("MAX_SEND_TIMEOUT_MS", &v))
				.transpose()?,
			request_timeout: var("REQUEST_TIMEOUT_MS")
				.map(|v| parse_number("REQUEST_TIMEOUT_MS", &v))
				.transpose()?,
			disable_event_persistence: var("DISABLE_EVENT_PERSISTENCE")
				.map(|v| parse_flag("DISABLE_EVENT_PERSISTENCE", &v))
				.transpose()?,
			use_beacon_api: var("USE_BEACON_API")
				.map(|v| parse_flag("USE_BEACON_API", &v))
				.transpose()?,
			cookie_name: var("COOKIE_NAME"),
			cookie_domain: var("COOKIE_DOMAIN"),
			cookie_policy: var("COOKIE_POLICY").map(|v| v.parse::<PrivacyPolicy>()).transpose()?,
			privacy_policy: var("PRIVACY_POLICY").map(|v| v.parse::<PrivacyPolicy>()).transpose()?,
			storage_dir: var("STORAGE_DIR").map(PathBuf::from),
		})
	}
}

fn load_secret<F>(lookup: &F, name: &str) -> Result<Option<ApiKey>>
where
	F: Fn(&str) -> Option<String>,
{
	let direct = format!("{ENV_PREFIX}{name}");
	let file_var = format!("{direct}_FILE");

	match (lookup(&direct), lookup(&file_var)) {
		(Some(_), Some(_)) => Err(HyperengageError::InvalidConfig(format!(
			"both {direct} and {file_var} are set"
		))),
		(Some(value), None) => Ok(non_blank(value)),
		(None, Some(path)) => {
			let content = std::fs::read_to_string(&path).map_err(|e| {
				HyperengageError::InvalidConfig(format!("cannot read {file_var} ({path}): {e}"))
			})?;
			Ok(non_blank(content))
		}
		(None, None) => Ok(None),
	}
}

fn non_blank(value: String) -> Option<ApiKey> {
	let trimmed = value.trim();
	(!trimmed.is_empty()).then(|| ApiKey::new(trimmed))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
	value
		.parse()
		.map_err(|_| HyperengageError::InvalidConfig(format!("{ENV_PREFIX}{name} must be a number")))
}

/// Accepts the usual spellings of a boolean flag.
fn parse_flag(name: &str, value: &str) -> Result<bool> {
	match value.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(HyperengageError::InvalidConfig(format!(
			"{ENV_PREFIX}{name} must be true or false"
		))),
	}
}
