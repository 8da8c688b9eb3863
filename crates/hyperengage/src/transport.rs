// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transports: how a JSON payload physically reaches the ingestion endpoint.
//!
//! The delivery queue only ever sees a [`Transport`]. Every implementation
//! reports non-2xx statuses, network errors and timeouts as a
//! [`TransportError`], so retry decisions never depend on which transport is
//! in use.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

/// A single physical send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl OutboundRequest {
	/// Case-insensitive header lookup.
	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Parses the body as JSON.
	pub fn json(&self) -> serde_json::Result<serde_json::Value> {
		serde_json::from_slice(&self.body)
	}
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
	pub status: u16,
	pub body: String,
}

/// Any failed send. Everything but [`TransportError::InvalidHeader`] is
/// treated as transient by the queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	#[error("network error: {0}")]
	Network(String),

	#[error("server responded with status {status}: {body}")]
	Status { status: u16, body: String },

	#[error("request timed out")]
	Timeout,

	#[error("invalid header {0}")]
	InvalidHeader(String),
}

impl TransportError {
	/// Whether sending the same request again could succeed.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, TransportError::InvalidHeader(_))
	}

	fn from_reqwest(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			TransportError::Timeout
		} else {
			TransportError::Network(err.to_string())
		}
	}
}

/// Sends a request to a URL and reports success or a uniform failure.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, TransportError> {
	let mut map = HeaderMap::with_capacity(headers.len());
	for (name, value) in headers {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| TransportError::InvalidHeader(name.clone()))?;
		let header_value =
			HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name.clone()))?;
		map.insert(header_name, header_value);
	}
	Ok(map)
}

fn check_status(status: u16, body: String) -> Result<TransportResponse, TransportError> {
	if (200..300).contains(&status) {
		Ok(TransportResponse { status, body })
	} else {
		Err(TransportError::Status { status, body })
	}
}

/// Async HTTP transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	/// Creates a transport whose requests give up after `timeout`.
	pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
		let client = hyperengage_common_http::builder().timeout(timeout).build()?;
		Ok(Self { client })
	}

	/// Wraps an existing client, for hosts that share one connection pool.
	pub fn with_client(client: reqwest::Client) -> Self {
		Self { client }
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
		let headers = header_map(&request.headers)?;

		debug!(url = %request.url, bytes = request.body.len(), "Sending event payload");

		let response = self
			.client
			.post(&request.url)
			.headers(headers)
			.body(request.body)
			.send()
			.await
			.map_err(TransportError::from_reqwest)?;

		let status = response.status().as_u16();
		let body = response.text().await.map_err(TransportError::from_reqwest)?;
		check_status(status, body)
	}
}

/// Best-effort synchronous transport for teardown and process-exit flushes.
///
/// A fresh blocking client is built per send so the transport can be used
/// where no async runtime is running. From async code the send is moved onto
/// the blocking thread pool.
#[derive(Debug, Clone)]
pub struct BeaconTransport {
	timeout: Duration,
}

impl BeaconTransport {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	/// Sends without an async runtime.
	///
	/// Must not be called from inside an async task; use [`Transport::send`]
	/// there instead.
	pub fn send_blocking(
		&self,
		request: &OutboundRequest,
	) -> Result<TransportResponse, TransportError> {
		let headers = header_map(&request.headers)?;

		let client = hyperengage_common_http::blocking_builder()
			.timeout(self.timeout)
			.build()
			.map_err(TransportError::from_reqwest)?;

		debug!(url = %request.url, bytes = request.body.len(), "Sending beacon payload");

		let response = client
			.post(&request.url)
			.headers(headers)
			.body(request.body.clone())
			.send()
			.map_err(TransportError::from_reqwest)?;

		let status = response.status().as_u16();
		let body = response.text().map_err(TransportError::from_reqwest)?;
		check_status(status, body)
	}
}

#[async_trait]
impl Transport for BeaconTransport {
	async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
		let transport = self.clone();
		tokio::task::spawn_blocking(move || transport.send_blocking(&request))
			.await
			.map_err(|e| TransportError::Network(format!("beacon task failed: {e}")))?
	}
}
