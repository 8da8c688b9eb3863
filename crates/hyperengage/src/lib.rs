// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rust SDK for Hyperengage event tracking.
//!
//! Tracks page views, custom events and user/account identification, and
//! delivers them to the ingestion endpoint with retries, backoff and an
//! optional persisted queue.
//!
//! # Example
//!
//! ```ignore
//! use hyperengage::{Environment, HyperengageClient, Properties, TrackOptions, UserIdentity};
//!
//! let client = HyperengageClient::builder()
//!     .key("your-api-key")
//!     .workspace_key("your-workspace-key")
//!     .tracking_host("https://events.hyperengage.io")
//!     .build()?;
//!
//! client.identify_user(
//!     UserIdentity::new("user_123")
//!         .traits(Properties::new().insert("email", "user@example.com")),
//! )?;
//!
//! let handle = client.track(
//!     "report_exported",
//!     TrackOptions::new()
//!         .properties(Properties::new().insert("format", "csv"))
//!         .env(Environment::from_url("https://app.example.com/reports?utm_source=mail")),
//! )?;
//!
//! // Waiting is optional; delivery continues in the background.
//! let outcome = handle.wait().await;
//!
//! client.flush().await?;
//! client.shutdown();
//! ```

mod client;
mod command_buffer;
mod config;
mod delivery;
mod error;
mod properties;
mod transport;

pub use client::{
	AccountIdentity, Dispatch, HyperengageClient, HyperengageClientBuilder, TrackOptions,
	UserIdentity,
};
pub use command_buffer::{Command, CommandBuffer, DEFAULT_COMMAND_CAPACITY};
pub use config::{
	ClientConfig, ClientOptions, HeaderProvider, PrivacyPolicy, DEFAULT_INGESTION_PATH,
	DEFAULT_REQUEST_TIMEOUT, EVENT_QUEUE_KEY,
};
pub use delivery::{
	AttemptState, DeliveryAttempt, DeliveryConfig, DeliveryHandle, DeliveryOutcome, DeliveryQueue,
};
pub use error::{HyperengageError, Result};
pub use properties::Properties;
pub use transport::{
	BeaconTransport, HttpTransport, OutboundRequest, Transport, TransportError, TransportResponse,
};

// Re-export core types for convenience
pub use hyperengage_common_http::RetryConfig;
pub use hyperengage_core::{
	enrich, ApiKey, Environment, EventEnvelope, EventId, EventType, FileStore, KeyValueStore,
	MemoryStore, PageContext, SessionIdentity,
};
