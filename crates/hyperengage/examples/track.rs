// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: track a few events with the Hyperengage SDK.
//!
//! Run with:
//!   HYPERENGAGE_KEY=... HYPERENGAGE_WORKSPACE_KEY=... \
//!   HYPERENGAGE_TRACKING_HOST=https://events.hyperengage.io \
//!   RUST_LOG=hyperengage=debug cargo run --example track -p hyperengage

use std::sync::Arc;

use hyperengage::{
	AccountIdentity, ClientOptions, CommandBuffer, Dispatch, Environment, FileStore,
	HyperengageClient, Properties, TrackOptions, UserIdentity,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.init();

	// Calls made before configuration is ready are buffered.
	let mut early = CommandBuffer::default();
	early.track(
		"app_started",
		TrackOptions::new().properties(Properties::new().insert("cold_start", true)),
	);

	let options = ClientOptions::from_env()?;
	let store = Arc::new(FileStore::from_xdg()?);

	println!("Initializing Hyperengage client...");
	let client = HyperengageClient::builder()
		.options(options)
		.store(store)
		.environment(Environment::from_url("https://app.example.com/dashboard"))
		.build()?;
	println!("  Endpoint: {}", client.config().endpoint());
	println!("  Anonymous ID: {}", client.anonymous_id());

	for result in early.replay(&client) {
		result?;
	}

	client.account(
		AccountIdentity::new("acct_example")
			.traits(Properties::new().insert("name", "Example Inc").insert("plan", "pro")),
		Dispatch::SessionOnly,
	)?;
	client.identify_user(
		UserIdentity::new("user_example_123")
			.traits(Properties::new().insert("email", "example@example.com")),
	)?;

	let handle = client.track(
		"report_exported",
		TrackOptions::new()
			.properties(Properties::new().insert("format", "csv"))
			.env(Environment::from_url(
				"https://app.example.com/reports?utm_source=newsletter&gclid=abc123",
			)),
	)?;

	println!("\nWaiting for delivery...");
	let outcome = handle.wait().await;
	println!("  Outcome: {:?}", outcome);

	let flushed = client.flush().await?;
	println!("  Flushed {} remaining events", flushed);

	client.shutdown();
	println!("\nDone!");
	Ok(())
}
