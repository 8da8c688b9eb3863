// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Hyperengage tracking SDK.
//!
//! This crate holds everything that does not talk to the network: the event
//! envelope, page/request context extraction, identity resolution and the
//! key-value storage capability. It is used by the `hyperengage` client crate.
//!
//! # Example
//!
//! ```
//! use hyperengage_core::{enrich, Environment, EventEnvelope, EventType, IdentityResolver};
//!
//! let identity = IdentityResolver::ephemeral();
//! identity.set_user_id("user_42");
//!
//! let context = enrich(&Environment::from_url(
//!     "https://app.example.com/pricing?utm_source=newsletter&gclid=abc",
//! ));
//! assert_eq!(context.utm["source"], "newsletter");
//!
//! let envelope = EventEnvelope::new(EventType::PageView, identity.resolve())
//!     .with_user_id(identity.session().user_id)
//!     .with_context(context);
//! assert_eq!(envelope.click_id["gclid"], "abc");
//! ```

pub mod api_key;
pub mod context;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod storage;

pub use api_key::ApiKey;
pub use context::{enrich, parse_query, Environment, PageContext, CLICK_ID_PARAMS};
pub use envelope::{EventEnvelope, EventId, EventType};
pub use error::{CoreError, Result};
pub use identity::{
	generate_anonymous_id, IdentityPersistence, IdentityResolver, IdentityScope, SessionIdentity,
	DEFAULT_COOKIE_NAME,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
