// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyperengage::{
	HyperengageClient, HyperengageClientBuilder, OutboundRequest, Transport, TransportError,
	TransportResponse,
};
use parking_lot::Mutex;

/// Records every request and fails the first `fail_first` sends.
pub struct RecordingTransport {
	fail_first: usize,
	fail_always: bool,
	sends: AtomicUsize,
	requests: Mutex<Vec<OutboundRequest>>,
}

impl RecordingTransport {
	pub fn succeeding() -> Arc<Self> {
		Self::failing_first(0)
	}

	pub fn failing_first(n: usize) -> Arc<Self> {
		Arc::new(Self {
			fail_first: n,
			fail_always: false,
			sends: AtomicUsize::new(0),
			requests: Mutex::new(Vec::new()),
		})
	}

	pub fn failing() -> Arc<Self> {
		Arc::new(Self {
			fail_first: 0,
			fail_always: true,
			sends: AtomicUsize::new(0),
			requests: Mutex::new(Vec::new()),
		})
	}

	pub fn requests(&self) -> Vec<OutboundRequest> {
		self.requests.lock().clone()
	}

	pub fn bodies(&self) -> Vec<serde_json::Value> {
		self
			.requests()
			.iter()
			.map(|r| r.json().expect("request body is JSON"))
			.collect()
	}
}

#[async_trait]
impl Transport for RecordingTransport {
	async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
		self.requests.lock().push(request);
		let n = self.sends.fetch_add(1, Ordering::SeqCst);
		if self.fail_always || n < self.fail_first {
			Err(TransportError::Status {
				status: 500,
				body: "unavailable".to_string(),
			})
		} else {
			Ok(TransportResponse {
				status: 200,
				body: "{}".to_string(),
			})
		}
	}
}

/// Builder with test keys and millisecond backoff.
pub fn builder(transport: Arc<RecordingTransport>) -> HyperengageClientBuilder {
	HyperengageClient::builder()
		.key("Test")
		.workspace_key("sdfdfdfds")
		.tracking_host("https://test-host.com")
		.min_send_timeout(Duration::from_millis(1))
		.max_send_timeout(Duration::from_millis(5))
		.jitter(false)
		.transport(transport)
}

/// Polls until the client has nothing pending.
pub async fn drain(client: &HyperengageClient) {
	tokio::time::timeout(Duration::from_secs(5), async {
		while client.pending_len() > 0 {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
	})
	.await
	.expect("queue drained in time");
}
