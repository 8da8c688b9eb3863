// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The public tracking client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyperengage_common_http::{RetryConfig, SDK_NAME, SDK_VERSION};
use hyperengage_core::{
	enrich, ApiKey, Environment, EventEnvelope, EventType, IdentityPersistence, IdentityResolver,
	FileStore, IdentityScope, KeyValueStore, MemoryStore, SessionIdentity,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::{
	ClientConfig, ClientOptions, HeaderProvider, DEFAULT_INGESTION_PATH, DEFAULT_REQUEST_TIMEOUT,
};
use crate::delivery::{DeliveryConfig, DeliveryHandle, DeliveryQueue};
use crate::error::{HyperengageError, Result};
use crate::properties::Properties;
use crate::transport::{BeaconTransport, HttpTransport, Transport};

/// Arguments to [`HyperengageClient::track`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackOptions {
	pub properties: Properties,
	/// Page or request the event happened on. Falls back to the client's
	/// default environment.
	pub env: Option<Environment>,
}

impl TrackOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn properties(mut self, properties: Properties) -> Self {
		self.properties = properties;
		self
	}

	pub fn env(mut self, env: Environment) -> Self {
		self.env = Some(env);
		self
	}
}

/// A user to identify.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserIdentity {
	pub user_id: String,
	pub traits: Properties,
	pub env: Option<Environment>,
}

impl UserIdentity {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			..Default::default()
		}
	}

	pub fn traits(mut self, traits: Properties) -> Self {
		self.traits = traits;
		self
	}

	pub fn env(mut self, env: Environment) -> Self {
		self.env = Some(env);
		self
	}
}

/// An account (company, team) to identify.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountIdentity {
	pub account_id: String,
	pub traits: Properties,
	pub env: Option<Environment>,
}

impl AccountIdentity {
	pub fn new(account_id: impl Into<String>) -> Self {
		Self {
			account_id: account_id.into(),
			..Default::default()
		}
	}

	pub fn traits(mut self, traits: Properties) -> Self {
		self.traits = traits;
		self
	}

	pub fn env(mut self, env: Environment) -> Self {
		self.env = Some(env);
		self
	}
}

/// Whether an identify call also sends an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
	/// Update the session and send an identify event.
	#[default]
	Send,
	/// Only update the session; later events carry the id.
	SessionOnly,
}

/// Builder for [`HyperengageClient`].
pub struct HyperengageClientBuilder {
	key: Option<ApiKey>,
	workspace_key: Option<ApiKey>,
	tracking_host: Option<String>,
	ingestion_path: String,
	retry: RetryConfig,
	request_timeout: Duration,
	custom_headers: Option<HeaderProvider>,
	disable_event_persistence: bool,
	persist_identity: bool,
	use_beacon_api: bool,
	identity_scope: IdentityScope,
	store: Option<Arc<dyn KeyValueStore>>,
	storage_dir: Option<PathBuf>,
	transport: Option<Arc<dyn Transport>>,
	environment: Option<Environment>,
}

impl HyperengageClientBuilder {
	/// Creates a new builder with default settings.
	pub fn new() -> Self {
		Self {
			key: None,
			workspace_key: None,
			tracking_host: None,
			ingestion_path: DEFAULT_INGESTION_PATH.to_string(),
			retry: RetryConfig::default(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			custom_headers: None,
			disable_event_persistence: false,
			persist_identity: true,
			use_beacon_api: false,
			identity_scope: IdentityScope::default(),
			store: None,
			storage_dir: None,
			transport: None,
			environment: None,
		}
	}

	/// Sets the API key.
	pub fn key(mut self, key: impl Into<ApiKey>) -> Self {
		self.key = Some(key.into());
		self
	}

	/// Sets the workspace key.
	pub fn workspace_key(mut self, key: impl Into<ApiKey>) -> Self {
		self.workspace_key = Some(key.into());
		self
	}

	/// Sets the base URL of the ingestion service.
	///
	/// Example: `https://events.hyperengage.io`
	pub fn tracking_host(mut self, host: impl Into<String>) -> Self {
		self.tracking_host = Some(host.into());
		self
	}

	/// Sets the endpoint path. Defaults to `/api/v1/event`.
	pub fn ingestion_path(mut self, path: impl Into<String>) -> Self {
		self.ingestion_path = path.into();
		self
	}

	/// Maximum physical sends per event. `1` disables retries.
	pub fn max_send_attempts(mut self, attempts: u32) -> Self {
		self.retry.max_attempts = attempts;
		self
	}

	/// Delay before the first retry.
	pub fn min_send_timeout(mut self, delay: Duration) -> Self {
		self.retry.min_delay = delay;
		self
	}

	/// Upper bound for any retry delay.
	pub fn max_send_timeout(mut self, delay: Duration) -> Self {
		self.retry.max_delay = delay;
		self
	}

	/// Randomizes retry delays. On by default.
	pub fn jitter(mut self, enabled: bool) -> Self {
		self.retry.jitter = enabled;
		self
	}

	/// Bounds every physical send.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	/// Sets a function producing extra headers. It runs before every send,
	/// retries included, so it may return a different value each time.
	///
	/// # Example
	///
	/// ```ignore
	/// let client = HyperengageClient::builder()
	///     .key("key")
	///     .workspace_key("workspace")
	///     .tracking_host("https://events.example.com")
	///     .custom_headers(|| {
	///         HashMap::from([("Authorization".to_string(), current_token())])
	///     })
	///     .build()?;
	/// ```
	pub fn custom_headers<F>(mut self, provider: F) -> Self
	where
		F: Fn() -> HashMap<String, String> + Send + Sync + 'static,
	{
		self.custom_headers = Some(Arc::new(provider));
		self
	}

	/// Keeps undelivered events in memory only.
	pub fn disable_event_persistence(mut self, disabled: bool) -> Self {
		self.disable_event_persistence = disabled;
		self
	}

	/// Whether the anonymous id is written to the store. On by default.
	pub fn persist_identity(mut self, enabled: bool) -> Self {
		self.persist_identity = enabled;
		self
	}

	/// Sends through the synchronous transport instead of the async one.
	pub fn use_beacon_api(mut self, enabled: bool) -> Self {
		self.use_beacon_api = enabled;
		self
	}

	/// Storage key of the anonymous id.
	pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
		self.identity_scope.cookie_name = name.into();
		self
	}

	/// Scopes the anonymous id to a domain.
	pub fn cookie_domain(mut self, domain: impl Into<String>) -> Self {
		self.identity_scope.cookie_domain = Some(domain.into());
		self
	}

	/// Where the anonymous id and queue snapshot live. Defaults to an
	/// in-memory store.
	pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Keeps the anonymous id and queue snapshot in files under `dir`.
	/// Ignored when [`HyperengageClientBuilder::store`] is also set.
	pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.storage_dir = Some(dir.into());
		self
	}

	/// Replaces the primary transport.
	pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Environment used when a call does not supply its own.
	pub fn environment(mut self, env: Environment) -> Self {
		self.environment = Some(env);
		self
	}

	/// Applies every option that is set, leaving the rest untouched.
	pub fn options(mut self, options: ClientOptions) -> Self {
		let persist_identity = options.persist_identity();
		if let Some(key) = options.key {
			self.key = Some(key);
		}
		if let Some(key) = options.workspace_key {
			self.workspace_key = Some(key);
		}
		if let Some(host) = options.tracking_host {
			self.tracking_host = Some(host);
		}
		if let Some(path) = options.ingestion_path {
			self.ingestion_path = path;
		}
		if let Some(attempts) = options.max_send_attempts {
			self.retry.max_attempts = attempts;
		}
		if let Some(ms) = options.min_send_timeout {
			self.retry.min_delay = Duration::from_millis(ms);
		}
		if let Some(ms) = options.max_send_timeout {
			self.retry.max_delay = Duration::from_millis(ms);
		}
		if let Some(ms) = options.request_timeout {
			self.request_timeout = Duration::from_millis(ms);
		}
		if let Some(disabled) = options.disable_event_persistence {
			self.disable_event_persistence = disabled;
		}
		if let Some(enabled) = options.use_beacon_api {
			self.use_beacon_api = enabled;
		}
		if let Some(name) = options.cookie_name {
			self.identity_scope.cookie_name = name;
		}
		if let Some(domain) = options.cookie_domain {
			self.identity_scope.cookie_domain = Some(domain);
		}
		if let Some(enabled) = persist_identity {
			self.persist_identity = enabled;
		}
		if let Some(dir) = options.storage_dir {
			self.storage_dir = Some(dir);
		}
		self
	}

	/// Validates the configuration and starts the client.
	///
	/// Must be called inside a Tokio runtime; delivery tasks run on it.
	/// Events persisted by an earlier client on the same store are resent.
	pub fn build(self) -> Result<HyperengageClient> {
		let key = self
			.key
			.filter(|k| !k.is_blank())
			.ok_or(HyperengageError::MissingKey)?;
		let workspace_key = self
			.workspace_key
			.filter(|k| !k.is_blank())
			.ok_or(HyperengageError::MissingWorkspaceKey)?;
		let tracking_host = normalize_tracking_host(self.tracking_host.as_deref())?;
		let ingestion_path = normalize_path(&self.ingestion_path);

		if self.retry.max_attempts < 1 {
			return Err(HyperengageError::InvalidConfig(
				"max_send_attempts must be at least 1".to_string(),
			));
		}
		if self.retry.min_delay > self.retry.max_delay {
			return Err(HyperengageError::InvalidConfig(
				"min_send_timeout must not exceed max_send_timeout".to_string(),
			));
		}
		if self.request_timeout.is_zero() {
			return Err(HyperengageError::InvalidConfig(
				"request_timeout must be greater than zero".to_string(),
			));
		}
		if self.identity_scope.cookie_name.trim().is_empty() {
			return Err(HyperengageError::InvalidConfig(
				"cookie_name must not be empty".to_string(),
			));
		}

		let runtime = Handle::try_current().map_err(|_| {
			HyperengageError::InvalidConfig("client must be built inside a Tokio runtime".to_string())
		})?;

		let config = ClientConfig {
			tracking_host,
			key,
			workspace_key,
			ingestion_path,
			retry: self.retry,
			request_timeout: self.request_timeout,
			custom_headers: self.custom_headers,
			disable_event_persistence: self.disable_event_persistence,
			persist_identity: self.persist_identity,
			use_beacon_api: self.use_beacon_api,
			identity_scope: self.identity_scope,
		};

		let store: Arc<dyn KeyValueStore> = match (self.store, &self.storage_dir) {
			(Some(store), _) => store,
			(None, Some(dir)) => Arc::new(FileStore::open(dir)?),
			(None, None) => Arc::new(MemoryStore::new()),
		};
		let beacon = BeaconTransport::new(config.request_timeout);
		let transport: Arc<dyn Transport> = match self.transport {
			Some(transport) => transport,
			None if config.use_beacon_api => Arc::new(beacon.clone()),
			None => Arc::new(HttpTransport::new(config.request_timeout)?),
		};

		let persistence = if config.persist_identity {
			IdentityPersistence::Persistent(Arc::clone(&store))
		} else {
			IdentityPersistence::Ephemeral
		};
		let identity = IdentityResolver::new(config.identity_scope.clone(), persistence);

		let queue_store = (!config.disable_event_persistence).then(|| Arc::clone(&store));
		let queue = DeliveryQueue::new(
			DeliveryConfig {
				endpoint: config.endpoint(),
				key: config.key.clone(),
				workspace_key: config.workspace_key.clone(),
				retry: config.retry.clone(),
				request_timeout: config.request_timeout,
				custom_headers: config.custom_headers.clone(),
			},
			transport,
			beacon,
			queue_store,
			runtime,
		);
		let restored = queue.rehydrate();

		info!(
			endpoint = %config.endpoint(),
			restored,
			beacon = config.use_beacon_api,
			"Hyperengage client initialized"
		);

		Ok(HyperengageClient {
			inner: Arc::new(ClientInner {
				config,
				identity,
				queue,
				environment: self.environment,
				closed: AtomicBool::new(false),
			}),
		})
	}
}

impl Default for HyperengageClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn normalize_tracking_host(host: Option<&str>) -> Result<String> {
	let host = host.map(str::trim).unwrap_or_default();
	if host.is_empty() {
		return Err(HyperengageError::InvalidTrackingHost(
			"tracking host is not set".to_string(),
		));
	}

	let parsed =
		url::Url::parse(host).map_err(|e| HyperengageError::InvalidTrackingHost(format!("{host}: {e}")))?;
	if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
		return Err(HyperengageError::InvalidTrackingHost(host.to_string()));
	}

	Ok(host.trim_end_matches('/').to_string())
}

fn normalize_path(path: &str) -> String {
	let path = path.trim();
	if path.is_empty() {
		DEFAULT_INGESTION_PATH.to_string()
	} else if path.starts_with('/') {
		path.to_string()
	} else {
		format!("/{path}")
	}
}

struct ClientInner {
	config: ClientConfig,
	identity: IdentityResolver,
	queue: DeliveryQueue,
	environment: Option<Environment>,
	closed: AtomicBool,
}

/// Tracking client. Cheap to clone; clones share identity and queue.
///
/// Tracking calls return as soon as the event is queued. They fail only for
/// malformed arguments or after [`HyperengageClient::shutdown`]; delivery
/// problems are reported through the returned [`DeliveryHandle`] and logs.
#[derive(Clone)]
pub struct HyperengageClient {
	inner: Arc<ClientInner>,
}

impl HyperengageClient {
	/// Creates a new client builder.
	pub fn builder() -> HyperengageClientBuilder {
		HyperengageClientBuilder::new()
	}

	/// Tracks an event.
	pub fn track(
		&self,
		event_type: impl Into<EventType>,
		options: TrackOptions,
	) -> Result<DeliveryHandle> {
		self.check_closed()?;
		let event_type = event_type.into();
		if event_type.as_str().trim().is_empty() {
			return Err(HyperengageError::ValidationFailed(
				"event type must not be empty".to_string(),
			));
		}

		let envelope = self.envelope(event_type, options.properties, options.env.as_ref());
		Ok(self.inner.queue.enqueue(envelope))
	}

	/// Attaches the user to the session and sends a `user_identify` event.
	pub fn identify_user(&self, identity: UserIdentity) -> Result<DeliveryHandle> {
		self.check_closed()?;
		let user_id = required_id("user_id", &identity.user_id)?;
		self.inner.identity.set_user_id(user_id);

		let envelope = self.envelope(EventType::UserIdentify, identity.traits, identity.env.as_ref());
		Ok(self.inner.queue.enqueue(envelope))
	}

	/// Attaches the user to the session, sending `user_identify` only for
	/// [`Dispatch::Send`].
	pub fn user(&self, identity: UserIdentity, dispatch: Dispatch) -> Result<Option<DeliveryHandle>> {
		match dispatch {
			Dispatch::Send => self.identify_user(identity).map(Some),
			Dispatch::SessionOnly => {
				self.check_closed()?;
				let user_id = required_id("user_id", &identity.user_id)?;
				self.inner.identity.set_user_id(user_id);
				debug!("User attached to session");
				Ok(None)
			}
		}
	}

	/// Attaches the account to the session, sending `account_identify` only
	/// for [`Dispatch::Send`].
	pub fn account(
		&self,
		identity: AccountIdentity,
		dispatch: Dispatch,
	) -> Result<Option<DeliveryHandle>> {
		self.check_closed()?;
		let account_id = required_id("account_id", &identity.account_id)?;
		self.inner.identity.set_account_id(account_id);

		match dispatch {
			Dispatch::Send => {
				let envelope =
					self.envelope(EventType::AccountIdentify, identity.traits, identity.env.as_ref());
				Ok(Some(self.inner.queue.enqueue(envelope)))
			}
			Dispatch::SessionOnly => {
				debug!("Account attached to session");
				Ok(None)
			}
		}
	}

	/// The anonymous id attached to every event.
	pub fn anonymous_id(&self) -> String {
		self.inner.identity.resolve()
	}

	/// The user and account currently attached to events.
	pub fn session(&self) -> SessionIdentity {
		self.inner.identity.session()
	}

	/// Forgets the user, the account and the anonymous id.
	pub fn reset(&self) {
		self.inner.identity.reset();
		info!("Session identity reset");
	}

	/// Sends every waiting event now as one batch.
	///
	/// Returns how many events the batch delivered; a failed batch is logged,
	/// rescheduled and reported as `0`.
	pub async fn flush(&self) -> Result<usize> {
		self.check_closed()?;
		Ok(self.inner.queue.flush().await.unwrap_or(0))
	}

	/// Sends every waiting event now through the synchronous transport.
	///
	/// For exit paths outside async code, such as a panic hook or the end of
	/// `main` after the runtime is gone.
	pub fn flush_blocking(&self) -> Result<usize> {
		self.check_closed()?;
		Ok(self.inner.queue.flush_blocking().unwrap_or(0))
	}

	/// Stops retries and rejects further calls. Idempotent.
	///
	/// Undelivered events stay in the persisted snapshot for the next client.
	pub fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.queue.shutdown();
		info!("Hyperengage client shutdown");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Events not yet delivered or given up on.
	pub fn pending_len(&self) -> usize {
		self.inner.queue.pending_len()
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			Err(HyperengageError::ClientShutdown)
		} else {
			Ok(())
		}
	}

	fn envelope(
		&self,
		event_type: EventType,
		payload: Properties,
		env: Option<&Environment>,
	) -> EventEnvelope {
		let anonymous_id = self.inner.identity.resolve();
		let session = self.inner.identity.session();

		let mut envelope = EventEnvelope::new(event_type, anonymous_id)
			.with_user_id(session.user_id)
			.with_account_id(session.account_id)
			.with_payload(payload.into_value())
			.with_source(SDK_NAME, SDK_VERSION);

		if let Some(env) = env.or(self.inner.environment.as_ref()) {
			envelope = envelope.with_context(enrich(env));
		}
		envelope
	}
}

fn required_id<'a>(field: &str, value: &'a str) -> Result<&'a str> {
	let trimmed = value.trim();
	if trimmed.is_empty() {
		Err(HyperengageError::ValidationFailed(format!(
			"{field} must not be empty"
		)))
	} else {
		Ok(trimmed)
	}
}
