// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity resolution for tracked events.
//!
//! Every envelope carries an `anonymous_id` that is stable for the lifetime
//! of the persisted identity (a cookie or storage key), plus the `user_id` and
//! `account_id` once the host has identified them.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::KeyValueStore;

/// Default storage key for the anonymous id.
pub const DEFAULT_COOKIE_NAME: &str = "__hyperengage_id";

/// Where the anonymous id is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityScope {
	pub cookie_name: String,
	pub cookie_domain: Option<String>,
}

impl Default for IdentityScope {
	fn default() -> Self {
		Self {
			cookie_name: DEFAULT_COOKIE_NAME.to_string(),
			cookie_domain: None,
		}
	}
}

impl IdentityScope {
	/// The key the anonymous id is stored under.
	///
	/// Ids for different cookie domains never collide in a shared store.
	pub fn storage_key(&self) -> String {
		match self
			.cookie_domain
			.as_deref()
			.map(|d| d.trim_start_matches('.'))
			.filter(|d| !d.is_empty())
		{
			Some(domain) => format!("{domain}_{}", self.cookie_name),
			None => self.cookie_name.clone(),
		}
	}
}

/// Identifiers attached to every envelope once known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
	pub user_id: Option<String>,
	pub account_id: Option<String>,
}

/// Whether the anonymous id outlives the resolver.
#[derive(Clone)]
pub enum IdentityPersistence {
	/// Read from and written to the store.
	Persistent(Arc<dyn KeyValueStore>),
	/// Generated per resolver, never written anywhere.
	Ephemeral,
}

impl std::fmt::Debug for IdentityPersistence {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			IdentityPersistence::Persistent(_) => f.write_str("Persistent"),
			IdentityPersistence::Ephemeral => f.write_str("Ephemeral"),
		}
	}
}

/// Generates a random, URL-safe anonymous id (32 lowercase hex characters).
pub fn generate_anonymous_id() -> String {
	Uuid::new_v4().simple().to_string()
}

/// Resolves the anonymous id and holds the session identity for one client.
///
/// The anonymous id is resolved once and cached; the check-then-write against
/// the store happens under a lock so concurrent first calls agree on one id.
pub struct IdentityResolver {
	scope: IdentityScope,
	persistence: IdentityPersistence,
	anonymous_id: Mutex<Option<String>>,
	session: RwLock<SessionIdentity>,
}

impl IdentityResolver {
	pub fn new(scope: IdentityScope, persistence: IdentityPersistence) -> Self {
		Self {
			scope,
			persistence,
			anonymous_id: Mutex::new(None),
			session: RwLock::new(SessionIdentity::default()),
		}
	}

	/// Resolver whose id lives only as long as the resolver itself.
	pub fn ephemeral() -> Self {
		Self::new(IdentityScope::default(), IdentityPersistence::Ephemeral)
	}

	pub fn scope(&self) -> &IdentityScope {
		&self.scope
	}

	/// Returns the anonymous id, creating and persisting it on first use.
	///
	/// Storage failures are logged and fall back to an in-memory id, so the
	/// result is never empty.
	pub fn resolve(&self) -> String {
		let mut cached = self.anonymous_id.lock();
		if let Some(id) = cached.as_ref() {
			return id.clone();
		}

		let id = match &self.persistence {
			IdentityPersistence::Ephemeral => generate_anonymous_id(),
			IdentityPersistence::Persistent(store) => self.load_or_create(store.as_ref()),
		};

		*cached = Some(id.clone());
		id
	}

	fn load_or_create(&self, store: &dyn KeyValueStore) -> String {
		let key = self.scope.storage_key();

		match store.get(&key) {
			Ok(Some(existing)) if !existing.trim().is_empty() => {
				debug!(key = %key, "loaded persisted anonymous id");
				return existing.trim().to_string();
			}
			Ok(_) => {}
			Err(e) => {
				warn!(key = %key, error = %e, "failed to read anonymous id, generating a new one");
			}
		}

		let id = generate_anonymous_id();
		if let Err(e) = store.set(&key, &id) {
			warn!(key = %key, error = %e, "failed to persist anonymous id");
		} else {
			debug!(key = %key, "persisted new anonymous id");
		}
		id
	}

	/// Attaches a user id to every later event.
	pub fn set_user_id(&self, user_id: impl Into<String>) {
		self.session.write().user_id = Some(user_id.into());
	}

	/// Attaches an account id to every later event.
	pub fn set_account_id(&self, account_id: impl Into<String>) {
		self.session.write().account_id = Some(account_id.into());
	}

	pub fn session(&self) -> SessionIdentity {
		self.session.read().clone()
	}

	/// Forgets the session identity and the anonymous id.
	///
	/// The next `resolve` creates a new anonymous id.
	pub fn reset(&self) {
		*self.session.write() = SessionIdentity::default();
		let mut cached = self.anonymous_id.lock();
		*cached = None;

		if let IdentityPersistence::Persistent(store) = &self.persistence {
			let key = self.scope.storage_key();
			if let Err(e) = store.remove(&key) {
				warn!(key = %key, error = %e, "failed to remove persisted anonymous id");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::MemoryStore;
	use proptest::prelude::*;

	fn persistent(store: Arc<MemoryStore>) -> IdentityResolver {
		IdentityResolver::new(
			IdentityScope::default(),
			IdentityPersistence::Persistent(store),
		)
	}

	#[test]
	fn test_resolve_is_idempotent() {
		let resolver = IdentityResolver::ephemeral();
		let first = resolver.resolve();
		assert!(!first.is_empty());
		assert_eq!(resolver.resolve(), first);
	}

	#[test]
	fn test_persisted_id_survives_new_resolver() {
		let store = Arc::new(MemoryStore::new());
		let first = persistent(store.clone()).resolve();
		let second = persistent(store.clone()).resolve();
		assert_eq!(first, second);
		assert_eq!(store.get(DEFAULT_COOKIE_NAME).unwrap(), Some(first));
	}

	#[test]
	fn test_ephemeral_resolvers_do_not_share_ids() {
		let a = IdentityResolver::ephemeral().resolve();
		let b = IdentityResolver::ephemeral().resolve();
		assert_ne!(a, b);
	}

	#[test]
	fn test_blank_stored_id_is_replaced() {
		let store = Arc::new(MemoryStore::new());
		store.set(DEFAULT_COOKIE_NAME, "  ").unwrap();
		let id = persistent(store).resolve();
		assert_eq!(id.len(), 32);
	}

	#[test]
	fn test_cookie_domain_scopes_the_key() {
		let scope = IdentityScope {
			cookie_name: "__id".to_string(),
			cookie_domain: Some(".example.com".to_string()),
		};
		assert_eq!(scope.storage_key(), "example.com___id");
	}

	#[test]
	fn test_concurrent_first_resolution_agrees() {
		let store = Arc::new(MemoryStore::new());
		let resolver = Arc::new(persistent(store));

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let resolver = Arc::clone(&resolver);
				std::thread::spawn(move || resolver.resolve())
			})
			.collect();

		let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		assert!(ids.windows(2).all(|w| w[0] == w[1]));
	}

	#[test]
	fn test_session_ids_stick_until_reset() {
		let store = Arc::new(MemoryStore::new());
		let resolver = persistent(store.clone());
		let before = resolver.resolve();

		resolver.set_user_id("1212");
		resolver.set_account_id("1234");
		assert_eq!(resolver.session().user_id.as_deref(), Some("1212"));
		assert_eq!(resolver.session().account_id.as_deref(), Some("1234"));

		resolver.reset();
		assert_eq!(resolver.session(), SessionIdentity::default());
		assert_eq!(store.get(DEFAULT_COOKIE_NAME).unwrap(), None);
		assert_ne!(resolver.resolve(), before);
	}

	proptest! {
		#[test]
		fn test_generated_ids_are_url_safe(_seed: u64) {
			let id = generate_anonymous_id();
			prop_assert_eq!(id.len(), 32);
			prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
		}
	}
}
