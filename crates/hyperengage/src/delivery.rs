// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivery queue: at-least-once sending with backoff, persistence and
//! optional batching.
//!
//! Every enqueued envelope gets a slot and a driver task. The driver claims
//! the slot, sends, and either settles it (delivered, exhausted, dropped) or
//! parks it until the next backoff deadline. A flush claims all idle slots at
//! once and sends them as a single JSON array.
//!
//! Slots carry an epoch. Whoever claims a slot bumps or checks the epoch, so
//! a driver that loses a slot to a flush never sends it a second time.
//!
//! State changes only bump a snapshot version. A single writer task copies
//! the table and writes it to the store from the blocking pool, so bursts of
//! changes collapse into one write and no store I/O happens under the slot
//! lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyperengage_common_http::{calculate_delay, RetryConfig};
use hyperengage_core::{ApiKey, EventEnvelope, EventId, KeyValueStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HeaderProvider, EVENT_QUEUE_KEY};
use crate::transport::{BeaconTransport, OutboundRequest, Transport, TransportError};

/// Where an attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
	Queued,
	Sending,
	AwaitingRetry,
	Delivered,
	Exhausted,
}

/// An envelope plus its delivery bookkeeping. This is what gets persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
	pub envelope: EventEnvelope,
	/// Physical sends made so far.
	pub attempts: u32,
	pub state: AttemptState,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub next_send_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
	fn new(envelope: EventEnvelope) -> Self {
		Self {
			envelope,
			attempts: 0,
			state: AttemptState::Queued,
			next_send_at: None,
		}
	}

	pub fn event_id(&self) -> EventId {
		self.envelope.event_id
	}

	fn is_idle(&self) -> bool {
		matches!(self.state, AttemptState::Queued | AttemptState::AwaitingRetry)
	}

	fn begin_send(&mut self) {
		self.state = AttemptState::Sending;
		self.attempts += 1;
		self.next_send_at = None;
	}

	fn schedule_retry(&mut self, delay: Duration) {
		self.state = AttemptState::AwaitingRetry;
		self.next_send_at = chrono::Duration::from_std(delay)
			.ok()
			.map(|d| Utc::now() + d);
	}
}

/// Final result of delivering one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// The endpoint answered 2xx.
	Delivered { attempts: u32 },
	/// Every allowed send failed.
	Exhausted { attempts: u32 },
	/// The envelope could not be encoded, or its request could not be built.
	Dropped { reason: String },
	/// The queue shut down before the envelope settled.
	Abandoned,
}

impl DeliveryOutcome {
	pub fn is_delivered(&self) -> bool {
		matches!(self, DeliveryOutcome::Delivered { .. })
	}
}

/// Resolves once the envelope it was returned for settles.
///
/// Dropping the handle does not cancel delivery.
#[derive(Debug)]
pub struct DeliveryHandle {
	event_id: EventId,
	rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryHandle {
	pub fn event_id(&self) -> EventId {
		self.event_id
	}

	pub async fn wait(self) -> DeliveryOutcome {
		self.rx.await.unwrap_or(DeliveryOutcome::Abandoned)
	}
}

/// What the queue needs to know to send.
#[derive(Clone)]
pub struct DeliveryConfig {
	pub endpoint: String,
	pub key: ApiKey,
	pub workspace_key: ApiKey,
	pub retry: RetryConfig,
	pub request_timeout: Duration,
	pub custom_headers: Option<HeaderProvider>,
}

struct Slot {
	attempt: DeliveryAttempt,
	epoch: u64,
	done: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl Slot {
	fn finish(self, outcome: DeliveryOutcome) {
		if let Some(done) = self.done {
			let _ = done.send(outcome);
		}
	}
}

struct Claimed {
	event_id: EventId,
	epoch: u64,
	envelope: EventEnvelope,
}

enum SendFailure {
	Encode(String),
	Transport(TransportError),
}

/// Writes queue snapshots to the store, never an older one over a newer one.
struct SnapshotWriter {
	store: Arc<dyn KeyValueStore>,
	/// Version of the last snapshot that reached the store.
	written: Mutex<u64>,
}

impl SnapshotWriter {
	fn new(store: Arc<dyn KeyValueStore>) -> Self {
		Self {
			store,
			written: Mutex::new(0),
		}
	}

	/// Blocking. Run it from the blocking pool or a teardown path.
	fn write(&self, version: u64, attempts: &[DeliveryAttempt]) {
		let mut written = self.written.lock();
		if version <= *written {
			return;
		}

		let result = if attempts.is_empty() {
			self.store.remove(EVENT_QUEUE_KEY)
		} else {
			match serde_json::to_string(attempts) {
				Ok(json) => self.store.set(EVENT_QUEUE_KEY, &json),
				Err(e) => {
					warn!(error = %e, "Failed to encode event queue snapshot");
					return;
				}
			}
		};

		match result {
			Ok(()) => *written = version,
			Err(e) => warn!(error = %e, "Failed to persist event queue"),
		}
	}
}

struct QueueInner {
	config: DeliveryConfig,
	transport: Arc<dyn Transport>,
	beacon: BeaconTransport,
	snapshots: Option<Arc<SnapshotWriter>>,
	runtime: Handle,
	slots: Mutex<BTreeMap<EventId, Slot>>,
	epochs: AtomicU64,
	/// Bumped under the slot lock on every change worth persisting.
	version: AtomicU64,
	dirty: watch::Sender<u64>,
	shutdown: CancellationToken,
}

/// The delivery queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
	inner: Arc<QueueInner>,
}

impl DeliveryQueue {
	/// Creates a queue. Driver tasks are spawned on `runtime`.
	///
	/// With a `store`, the set of undelivered attempts is written to it in
	/// the background after state changes, and synchronously on
	/// [`DeliveryQueue::shutdown`] and [`DeliveryQueue::flush_blocking`].
	pub fn new(
		config: DeliveryConfig,
		transport: Arc<dyn Transport>,
		beacon: BeaconTransport,
		store: Option<Arc<dyn KeyValueStore>>,
		runtime: Handle,
	) -> Self {
		let (dirty, dirty_rx) = watch::channel(0);
		let inner = Arc::new(QueueInner {
			config,
			transport,
			beacon,
			snapshots: store.map(|store| Arc::new(SnapshotWriter::new(store))),
			runtime,
			slots: Mutex::new(BTreeMap::new()),
			epochs: AtomicU64::new(0),
			version: AtomicU64::new(0),
			dirty,
			shutdown: CancellationToken::new(),
		});

		if let Some(writer) = &inner.snapshots {
			inner.runtime.spawn(write_snapshots(
				Arc::downgrade(&inner),
				Arc::clone(writer),
				dirty_rx,
			));
		}

		Self { inner }
	}

	/// Accepts an envelope for delivery. Never fails; the outcome arrives on
	/// the returned handle.
	pub fn enqueue(&self, envelope: EventEnvelope) -> DeliveryHandle {
		let (tx, rx) = oneshot::channel();
		let event_id = envelope.event_id;
		let handle = DeliveryHandle { event_id, rx };

		if self.inner.shutdown.is_cancelled() {
			let _ = tx.send(DeliveryOutcome::Abandoned);
			return handle;
		}

		let epoch = self.inner.next_epoch();
		{
			let mut slots = self.inner.slots.lock();
			slots.insert(
				event_id,
				Slot {
					attempt: DeliveryAttempt::new(envelope),
					epoch,
					done: Some(tx),
				},
			);
			self.inner.mark_dirty();
		}

		debug!(event_id = %event_id, "Event queued");
		self
			.inner
			.runtime
			.spawn(drive(Arc::clone(&self.inner), event_id, epoch, None));
		handle
	}

	/// Re-enqueues attempts persisted by an earlier queue on the same store.
	///
	/// Attempt counts carry over; attempts that already used every send are
	/// discarded. Returns how many attempts were restored.
	pub fn rehydrate(&self) -> usize {
		let Some(writer) = &self.inner.snapshots else {
			return 0;
		};
		let store = &writer.store;

		let raw = match store.get(EVENT_QUEUE_KEY) {
			Ok(Some(raw)) => raw,
			Ok(None) => return 0,
			Err(e) => {
				warn!(error = %e, "Failed to read persisted event queue");
				return 0;
			}
		};

		let attempts: Vec<DeliveryAttempt> = match serde_json::from_str(&raw) {
			Ok(attempts) => attempts,
			Err(e) => {
				warn!(error = %e, "Discarding unreadable event queue snapshot");
				if let Err(e) = store.remove(EVENT_QUEUE_KEY) {
					warn!(error = %e, "Failed to remove event queue snapshot");
				}
				return 0;
			}
		};

		let mut restored = Vec::new();
		{
			let mut slots = self.inner.slots.lock();
			for mut attempt in attempts {
				let event_id = attempt.event_id();
				if slots.contains_key(&event_id) {
					continue;
				}
				if !self.inner.config.retry.allows_retry(attempt.attempts) {
					warn!(
						event_id = %event_id,
						attempts = attempt.attempts,
						"Dropping restored event with no send attempts left"
					);
					continue;
				}

				attempt.state = AttemptState::Queued;
				attempt.next_send_at = None;
				let epoch = self.inner.next_epoch();
				slots.insert(
					event_id,
					Slot {
						attempt,
						epoch,
						done: None,
					},
				);
				restored.push((event_id, epoch));
			}
			self.inner.mark_dirty();
		}
		self.inner.persist_now();

		for (event_id, epoch) in &restored {
			self
				.inner
				.runtime
				.spawn(drive(Arc::clone(&self.inner), *event_id, *epoch, None));
		}

		if !restored.is_empty() {
			info!(count = restored.len(), "Restored persisted events");
		}
		restored.len()
	}

	/// Sends every idle attempt now, as one JSON array.
	///
	/// Returns how many envelopes the batch delivered. A failed batch counts
	/// as one send for each member; members with sends left are rescheduled.
	pub async fn flush(&self) -> Result<usize, TransportError> {
		let batch = self.inner.claim_idle();
		let Some((members, body)) = self.inner.encode_batch(batch) else {
			return Ok(0);
		};

		debug!(count = members.len(), "Flushing event batch");
		// Members are already claimed; the batch settles even if this future
		// is dropped mid-send.
		let inner = Arc::clone(&self.inner);
		let batch = self.inner.runtime.spawn(async move {
			let result = inner.send_body(body).await;
			inner.finish_batch(members, result)
		});
		batch
			.await
			.map_err(|e| TransportError::Network(format!("flush task failed: {e}")))?
	}

	/// Like [`DeliveryQueue::flush`], but through the synchronous transport.
	///
	/// Meant for teardown paths with no async context; do not call it from
	/// inside an async task.
	pub fn flush_blocking(&self) -> Result<usize, TransportError> {
		let batch = self.inner.claim_idle();
		let Some((members, body)) = self.inner.encode_batch(batch) else {
			return Ok(0);
		};

		debug!(count = members.len(), "Flushing event batch synchronously");
		let request = self.inner.request(body);
		let result = self.inner.beacon.send_blocking(&request).map(|_| ());
		let flushed = self.inner.finish_batch(members, result);
		self.inner.persist_now();
		flushed
	}

	/// Stops all retry timers and resolves outstanding handles as
	/// [`DeliveryOutcome::Abandoned`].
	///
	/// Sends already in flight run to completion. Undelivered attempts stay
	/// in the persisted snapshot, which is written before this returns.
	pub fn shutdown(&self) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}
		self.inner.shutdown.cancel();

		let pending = {
			let mut slots = self.inner.slots.lock();
			for slot in slots.values_mut() {
				if let Some(done) = slot.done.take() {
					let _ = done.send(DeliveryOutcome::Abandoned);
				}
			}
			slots.len()
		};
		self.inner.persist_now();
		info!(pending, "Delivery queue stopped");
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	/// Number of attempts not yet delivered or given up on.
	pub fn pending_len(&self) -> usize {
		self.inner.slots.lock().len()
	}

	/// Copies of the attempts not yet settled, oldest first.
	pub fn pending(&self) -> Vec<DeliveryAttempt> {
		self
			.inner
			.slots
			.lock()
			.values()
			.map(|slot| slot.attempt.clone())
			.collect()
	}
}

async fn drive(inner: Arc<QueueInner>, event_id: EventId, epoch: u64, mut wait: Option<Duration>) {
	loop {
		if let Some(delay) = wait.take() {
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = inner.shutdown.cancelled() => return,
			}
		}

		let Some(envelope) = inner.claim(event_id, epoch) else {
			return;
		};
		let result = inner.send_single(&envelope).await;
		match inner.settle(event_id, epoch, result) {
			Some(delay) => wait = Some(delay),
			None => return,
		}
	}
}

async fn write_snapshots(
	queue: Weak<QueueInner>,
	writer: Arc<SnapshotWriter>,
	mut dirty: watch::Receiver<u64>,
) {
	while dirty.changed().await.is_ok() {
		let Some(inner) = queue.upgrade() else {
			break;
		};
		let (version, attempts) = inner.snapshot();
		drop(inner);

		let writer = Arc::clone(&writer);
		if let Err(e) = tokio::task::spawn_blocking(move || writer.write(version, &attempts)).await {
			warn!(error = %e, "Event queue snapshot task failed");
		}
	}
}

impl QueueInner {
	fn next_epoch(&self) -> u64 {
		self.epochs.fetch_add(1, Ordering::Relaxed)
	}

	fn claim(&self, event_id: EventId, epoch: u64) -> Option<EventEnvelope> {
		if self.shutdown.is_cancelled() {
			return None;
		}

		let mut slots = self.slots.lock();
		let slot = slots.get_mut(&event_id)?;
		if slot.epoch != epoch || !slot.attempt.is_idle() {
			return None;
		}
		slot.attempt.begin_send();
		let envelope = slot.attempt.envelope.clone();
		self.mark_dirty();
		Some(envelope)
	}

	fn claim_idle(&self) -> Vec<Claimed> {
		if self.shutdown.is_cancelled() {
			return Vec::new();
		}

		let mut slots = self.slots.lock();
		let mut claimed = Vec::new();
		for (event_id, slot) in slots.iter_mut() {
			if !slot.attempt.is_idle() {
				continue;
			}
			slot.epoch = self.next_epoch();
			slot.attempt.begin_send();
			claimed.push(Claimed {
				event_id: *event_id,
				epoch: slot.epoch,
				envelope: slot.attempt.envelope.clone(),
			});
		}
		if !claimed.is_empty() {
			self.mark_dirty();
		}
		claimed
	}

	/// Encodes claimed envelopes as a JSON array. Members that fail to encode
	/// are dropped on the spot.
	fn encode_batch(&self, batch: Vec<Claimed>) -> Option<(Vec<Claimed>, Vec<u8>)> {
		let mut members = Vec::with_capacity(batch.len());
		let mut values = Vec::with_capacity(batch.len());
		for claimed in batch {
			match serde_json::to_value(&claimed.envelope) {
				Ok(value) => {
					values.push(value);
					members.push(claimed);
				}
				Err(e) => {
					self.settle(
						claimed.event_id,
						claimed.epoch,
						Err(SendFailure::Encode(e.to_string())),
					);
				}
			}
		}

		if members.is_empty() {
			return None;
		}

		match serde_json::to_vec(&values) {
			Ok(body) => Some((members, body)),
			Err(e) => {
				for claimed in members {
					self.settle(
						claimed.event_id,
						claimed.epoch,
						Err(SendFailure::Encode(e.to_string())),
					);
				}
				None
			}
		}
	}

	/// Builds the request, calling the header provider afresh.
	fn request(&self, body: Vec<u8>) -> OutboundRequest {
		let mut headers = vec![
			("Content-Type".to_string(), "application/json".to_string()),
			("X-Api-Key".to_string(), self.config.key.expose().to_string()),
			(
				"X-Workspace-Key".to_string(),
				self.config.workspace_key.expose().to_string(),
			),
		];

		if let Some(provider) = &self.config.custom_headers {
			for (name, value) in provider() {
				match headers
					.iter_mut()
					.find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
				{
					Some(existing) => existing.1 = value,
					None => headers.push((name, value)),
				}
			}
		}

		OutboundRequest {
			url: self.config.endpoint.clone(),
			headers,
			body,
		}
	}

	async fn send_body(&self, body: Vec<u8>) -> Result<(), TransportError> {
		let request = self.request(body);
		match tokio::time::timeout(self.config.request_timeout, self.transport.send(request)).await {
			Ok(Ok(_)) => Ok(()),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(TransportError::Timeout),
		}
	}

	async fn send_single(&self, envelope: &EventEnvelope) -> Result<(), SendFailure> {
		let body = serde_json::to_vec(envelope).map_err(|e| SendFailure::Encode(e.to_string()))?;
		self.send_body(body).await.map_err(SendFailure::Transport)
	}

	/// Records the result of a single send. Returns the backoff delay when
	/// the attempt should be retried.
	fn settle(
		&self,
		event_id: EventId,
		epoch: u64,
		result: Result<(), SendFailure>,
	) -> Option<Duration> {
		let mut slots = self.slots.lock();
		if !slots.get(&event_id).is_some_and(|slot| slot.epoch == epoch) {
			return None;
		}

		let retry = match result {
			Ok(()) => {
				if let Some(slot) = slots.remove(&event_id) {
					let attempts = slot.attempt.attempts;
					debug!(event_id = %event_id, attempts, "Event delivered");
					slot.finish(DeliveryOutcome::Delivered { attempts });
				}
				None
			}
			Err(SendFailure::Encode(reason)) => {
				if let Some(slot) = slots.remove(&event_id) {
					error!(event_id = %event_id, error = %reason, "Dropping event that cannot be encoded");
					slot.finish(DeliveryOutcome::Dropped { reason });
				}
				None
			}
			Err(SendFailure::Transport(err)) if !err.is_retryable() => {
				drop_unsendable(&mut slots, event_id, &err);
				None
			}
			Err(SendFailure::Transport(err)) => self.after_failure(&mut slots, event_id, &err),
		};

		self.mark_dirty();
		retry
	}

	fn after_failure(
		&self,
		slots: &mut BTreeMap<EventId, Slot>,
		event_id: EventId,
		err: &TransportError,
	) -> Option<Duration> {
		let slot = slots.get_mut(&event_id)?;
		let attempts = slot.attempt.attempts;

		if !self.config.retry.allows_retry(attempts) {
			let slot = slots.remove(&event_id)?;
			warn!(
				event_id = %event_id,
				attempts,
				error = %err,
				"Giving up on event after exhausting send attempts"
			);
			slot.finish(DeliveryOutcome::Exhausted { attempts });
			return None;
		}

		let delay = calculate_delay(&self.config.retry, attempts);
		slot.attempt.schedule_retry(delay);
		debug!(
			event_id = %event_id,
			attempts,
			delay_ms = delay.as_millis() as u64,
			error = %err,
			"Send failed, retry scheduled"
		);
		Some(delay)
	}

	fn finish_batch(
		self: &Arc<Self>,
		members: Vec<Claimed>,
		result: Result<(), TransportError>,
	) -> Result<usize, TransportError> {
		let mut delivered = 0;
		let mut retries = Vec::new();
		{
			let mut slots = self.slots.lock();
			for claimed in members {
				let current = slots
					.get(&claimed.event_id)
					.is_some_and(|slot| slot.epoch == claimed.epoch);
				if !current {
					continue;
				}

				match &result {
					Ok(()) => {
						if let Some(slot) = slots.remove(&claimed.event_id) {
							let attempts = slot.attempt.attempts;
							slot.finish(DeliveryOutcome::Delivered { attempts });
							delivered += 1;
						}
					}
					Err(err) if !err.is_retryable() => {
						drop_unsendable(&mut slots, claimed.event_id, err);
					}
					Err(err) => {
						if let Some(delay) = self.after_failure(&mut slots, claimed.event_id, err) {
							retries.push((claimed.event_id, claimed.epoch, delay));
						}
					}
				}
			}
			self.mark_dirty();
		}

		for (event_id, epoch, delay) in retries {
			self
				.runtime
				.spawn(drive(Arc::clone(self), event_id, epoch, Some(delay)));
		}

		match result {
			Ok(()) => {
				debug!(count = delivered, "Event batch delivered");
				Ok(delivered)
			}
			Err(e) => {
				warn!(error = %e, "Event batch failed");
				Err(e)
			}
		}
	}

	/// Records that the slot table changed. Call with the slot lock held.
	fn mark_dirty(&self) {
		if self.snapshots.is_some() {
			let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
			self.dirty.send_replace(version);
		}
	}

	/// Copies the unsettled attempts together with the version they reflect.
	fn snapshot(&self) -> (u64, Vec<DeliveryAttempt>) {
		let slots = self.slots.lock();
		let version = self.version.load(Ordering::Relaxed);
		let attempts = slots.values().map(|slot| slot.attempt.clone()).collect();
		(version, attempts)
	}

	/// Writes the current snapshot from the calling thread.
	fn persist_now(&self) {
		if let Some(writer) = &self.snapshots {
			let (version, attempts) = self.snapshot();
			writer.write(version, &attempts);
		}
	}
}

/// Drops an attempt whose request can never be sent as built.
fn drop_unsendable(slots: &mut BTreeMap<EventId, Slot>, event_id: EventId, err: &TransportError) {
	if let Some(slot) = slots.remove(&event_id) {
		error!(event_id = %event_id, error = %err, "Dropping event whose request cannot be built");
		slot.finish(DeliveryOutcome::Dropped {
			reason: err.to_string(),
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::{HashMap, VecDeque};
	use std::sync::atomic::AtomicU32;

	use async_trait::async_trait;
	use hyperengage_core::{EventType, MemoryStore};
	use tokio::time::Instant;

	use crate::transport::TransportResponse;

	/// Answers from a script of results, then succeeds.
	#[derive(Default)]
	struct ScriptedTransport {
		script: Mutex<VecDeque<Result<(), TransportError>>>,
		always_fail: bool,
		requests: Mutex<Vec<OutboundRequest>>,
		sent_at: Mutex<Vec<Instant>>,
	}

	impl ScriptedTransport {
		fn scripted(script: Vec<Result<(), TransportError>>) -> Arc<Self> {
			Arc::new(Self {
				script: Mutex::new(script.into()),
				..Default::default()
			})
		}

		fn failing_first(n: usize) -> Arc<Self> {
			Self::scripted(
				(0..n)
					.map(|_| {
						Err(TransportError::Status {
							status: 503,
							body: String::new(),
						})
					})
					.collect(),
			)
		}

		fn always_failing() -> Arc<Self> {
			Arc::new(Self {
				always_fail: true,
				..Default::default()
			})
		}

		fn requests(&self) -> Vec<OutboundRequest> {
			self.requests.lock().clone()
		}

		fn sent_at(&self) -> Vec<Instant> {
			self.sent_at.lock().clone()
		}
	}

	#[async_trait]
	impl Transport for ScriptedTransport {
		async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
			self.requests.lock().push(request);
			self.sent_at.lock().push(Instant::now());
			if self.always_fail {
				return Err(TransportError::Network("connection refused".to_string()));
			}
			match self.script.lock().pop_front() {
				Some(Err(e)) => Err(e),
				_ => Ok(TransportResponse {
					status: 200,
					body: "{}".to_string(),
				}),
			}
		}
	}

	/// Succeeds, but only after `delay`.
	struct SlowTransport {
		delay: Duration,
		sends: AtomicU32,
	}

	impl SlowTransport {
		fn new(delay: Duration) -> Arc<Self> {
			Arc::new(Self {
				delay,
				sends: AtomicU32::new(0),
			})
		}
	}

	#[async_trait]
	impl Transport for SlowTransport {
		async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
			self.sends.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(self.delay).await;
			Ok(TransportResponse {
				status: 200,
				body: String::new(),
			})
		}
	}

	/// Memory store that counts writes.
	#[derive(Default)]
	struct CountingStore {
		inner: MemoryStore,
		writes: AtomicU32,
	}

	impl CountingStore {
		fn writes(&self) -> u32 {
			self.writes.load(Ordering::SeqCst)
		}
	}

	impl KeyValueStore for CountingStore {
		fn get(&self, key: &str) -> hyperengage_core::Result<Option<String>> {
			self.inner.get(key)
		}

		fn set(&self, key: &str, value: &str) -> hyperengage_core::Result<()> {
			self.writes.fetch_add(1, Ordering::SeqCst);
			self.inner.set(key, value)
		}

		fn remove(&self, key: &str) -> hyperengage_core::Result<()> {
			self.writes.fetch_add(1, Ordering::SeqCst);
			self.inner.remove(key)
		}
	}

	fn config(max_attempts: u32) -> DeliveryConfig {
		DeliveryConfig {
			endpoint: "https://t.example.com/api/v1/event".to_string(),
			key: ApiKey::new("api-key"),
			workspace_key: ApiKey::new("ws-key"),
			retry: RetryConfig {
				max_attempts,
				min_delay: Duration::from_millis(1),
				max_delay: Duration::from_millis(5),
				jitter: false,
			},
			request_timeout: Duration::from_secs(2),
			custom_headers: None,
		}
	}

	fn queue(config: DeliveryConfig, transport: Arc<dyn Transport>) -> DeliveryQueue {
		queue_with_store(config, transport, None)
	}

	fn queue_with_store(
		config: DeliveryConfig,
		transport: Arc<dyn Transport>,
		store: Option<Arc<dyn KeyValueStore>>,
	) -> DeliveryQueue {
		DeliveryQueue::new(
			config,
			transport,
			BeaconTransport::new(Duration::from_secs(1)),
			store,
			Handle::current(),
		)
	}

	fn envelope(name: &str) -> EventEnvelope {
		EventEnvelope::new(EventType::from(name), "anon-1")
	}

	fn persisted(store: &dyn KeyValueStore) -> Option<Vec<DeliveryAttempt>> {
		store
			.get(EVENT_QUEUE_KEY)
			.unwrap()
			.map(|raw| serde_json::from_str(&raw).unwrap())
	}

	#[tokio::test]
	async fn test_delivers_on_first_success() {
		let transport = ScriptedTransport::failing_first(0);
		let queue = queue(config(4), transport.clone());

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
		let requests = transport.requests();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].header("x-api-key"), Some("api-key"));
		assert_eq!(requests[0].header("x-workspace-key"), Some("ws-key"));
		assert_eq!(requests[0].header("content-type"), Some("application/json"));
		assert_eq!(requests[0].json().unwrap()["event_type"], "signup");
		assert_eq!(queue.pending_len(), 0);
	}

	#[tokio::test]
	async fn test_retries_until_success() {
		let transport = ScriptedTransport::failing_first(2);
		let queue = queue(config(4), transport.clone());

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
		assert_eq!(transport.requests().len(), 3);
	}

	#[tokio::test]
	async fn test_single_attempt_means_no_retry() {
		let transport = ScriptedTransport::always_failing();
		let queue = queue(config(1), transport.clone());

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 1 });
		assert_eq!(transport.requests().len(), 1);
		assert_eq!(queue.pending_len(), 0);
	}

	#[tokio::test]
	async fn test_gives_up_after_max_attempts() {
		let transport = ScriptedTransport::always_failing();
		let queue = queue(config(3), transport.clone());

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 3 });
		assert_eq!(transport.requests().len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_retries_wait_out_the_backoff() {
		let transport = ScriptedTransport::always_failing();
		let mut config = config(3);
		config.retry.min_delay = Duration::from_secs(1);
		config.retry.max_delay = Duration::from_secs(60);
		let queue = queue(config, transport.clone());

		let handle = queue.enqueue(envelope("signup"));

		tokio::time::sleep(Duration::from_millis(990)).await;
		assert_eq!(transport.requests().len(), 1);

		assert_eq!(handle.wait().await, DeliveryOutcome::Exhausted { attempts: 3 });
		let sent_at = transport.sent_at();
		assert_eq!(sent_at.len(), 3);

		let first_gap = sent_at[1] - sent_at[0];
		let second_gap = sent_at[2] - sent_at[1];
		assert!(first_gap >= Duration::from_secs(1), "first gap {first_gap:?}");
		assert!(first_gap < Duration::from_millis(1100), "first gap {first_gap:?}");
		assert!(second_gap >= Duration::from_secs(2), "second gap {second_gap:?}");
		assert!(second_gap < Duration::from_millis(2100), "second gap {second_gap:?}");
	}

	#[tokio::test]
	async fn test_custom_headers_are_recomputed_per_send() {
		let counter = Arc::new(AtomicU32::new(0));
		let provider_counter = Arc::clone(&counter);
		let mut config = config(4);
		config.custom_headers = Some(Arc::new(move || {
			let n = provider_counter.fetch_add(1, Ordering::SeqCst);
			HashMap::from([("Authorization".to_string(), format!("Bearer token-{n}"))])
		}));

		let transport = ScriptedTransport::failing_first(2);
		let queue = queue(config, transport.clone());
		queue.enqueue(envelope("signup")).wait().await;

		let tokens: Vec<String> = transport
			.requests()
			.iter()
			.map(|r| r.header("authorization").unwrap_or_default().to_string())
			.collect();
		assert_eq!(
			tokens,
			vec!["Bearer token-0", "Bearer token-1", "Bearer token-2"]
		);
	}

	#[tokio::test]
	async fn test_custom_headers_override_defaults() {
		let mut config = config(1);
		config.custom_headers = Some(Arc::new(|| {
			HashMap::from([("content-type".to_string(), "text/plain".to_string())])
		}));

		let transport = ScriptedTransport::failing_first(0);
		let queue = queue(config, transport.clone());
		queue.enqueue(envelope("signup")).wait().await;

		let request = &transport.requests()[0];
		assert_eq!(request.header("Content-Type"), Some("text/plain"));
		assert_eq!(
			request
				.headers
				.iter()
				.filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
				.count(),
			1
		);
	}

	#[tokio::test]
	async fn test_unbuildable_request_is_dropped_without_retry() {
		let transport = ScriptedTransport::scripted(vec![Err(TransportError::InvalidHeader(
			"bad header".to_string(),
		))]);
		let queue = queue(config(4), transport.clone());

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert!(matches!(outcome, DeliveryOutcome::Dropped { .. }));
		assert_eq!(transport.requests().len(), 1);
		assert_eq!(queue.pending_len(), 0);
	}

	#[tokio::test]
	async fn test_unbuildable_batch_is_dropped_without_retry() {
		let transport = ScriptedTransport::scripted(vec![Err(TransportError::InvalidHeader(
			"bad header".to_string(),
		))]);
		let queue = queue(config(4), transport.clone());

		let first = queue.enqueue(envelope("a"));
		let second = queue.enqueue(envelope("b"));
		assert!(queue.flush().await.is_err());

		assert!(matches!(first.wait().await, DeliveryOutcome::Dropped { .. }));
		assert!(matches!(second.wait().await, DeliveryOutcome::Dropped { .. }));
		assert_eq!(transport.requests().len(), 1);
		assert_eq!(queue.pending_len(), 0);
	}

	#[tokio::test]
	async fn test_slow_send_counts_as_failure() {
		let mut config = config(1);
		config.request_timeout = Duration::from_millis(20);
		let queue = queue(config, SlowTransport::new(Duration::from_secs(5)));

		let outcome = queue.enqueue(envelope("signup")).wait().await;

		assert_eq!(outcome, DeliveryOutcome::Exhausted { attempts: 1 });
	}

	#[tokio::test]
	async fn test_flush_sends_idle_events_as_one_array() {
		let transport = ScriptedTransport::failing_first(0);
		let queue = queue(config(4), transport.clone());

		// Drivers only run once this task yields, so the flush claims all three.
		let handles: Vec<_> = ["a", "b", "c"]
			.into_iter()
			.map(|name| queue.enqueue(envelope(name)))
			.collect();
		let delivered = queue.flush().await.unwrap();

		assert_eq!(delivered, 3);
		for handle in handles {
			assert_eq!(handle.wait().await, DeliveryOutcome::Delivered { attempts: 1 });
		}

		let requests = transport.requests();
		assert_eq!(requests.len(), 1);
		let body = requests[0].json().unwrap();
		let names: Vec<&str> = body
			.as_array()
			.unwrap()
			.iter()
			.map(|e| e["event_type"].as_str().unwrap())
			.collect();
		assert_eq!(names, vec!["a", "b", "c"]);
	}

	#[tokio::test]
	async fn test_dropped_flush_still_settles_its_batch() {
		let transport = SlowTransport::new(Duration::from_millis(200));
		let queue = queue(config(4), transport.clone());

		let handle = queue.enqueue(envelope("a"));
		let flushed = tokio::time::timeout(Duration::from_millis(20), queue.flush()).await;
		assert!(flushed.is_err());

		let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
			.await
			.unwrap();
		assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
		assert_eq!(queue.pending_len(), 0);
		assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_failed_flush_counts_one_send_per_member() {
		let transport = ScriptedTransport::failing_first(1);
		let queue = queue(config(4), transport.clone());

		let first = queue.enqueue(envelope("a"));
		let second = queue.enqueue(envelope("b"));
		assert!(queue.flush().await.is_err());

		assert_eq!(first.wait().await, DeliveryOutcome::Delivered { attempts: 2 });
		assert_eq!(second.wait().await, DeliveryOutcome::Delivered { attempts: 2 });
		assert_eq!(transport.requests().len(), 3);
	}

	#[tokio::test]
	async fn test_flush_with_nothing_idle_sends_nothing() {
		let transport = ScriptedTransport::failing_first(0);
		let queue = queue(config(4), transport.clone());

		assert_eq!(queue.flush().await.unwrap(), 0);
		assert!(transport.requests().is_empty());
	}

	#[tokio::test]
	async fn test_enqueue_leaves_store_writes_to_the_writer() {
		let store = Arc::new(CountingStore::default());
		let queue = queue_with_store(
			config(4),
			ScriptedTransport::failing_first(0),
			Some(store.clone() as Arc<dyn KeyValueStore>),
		);

		// Nothing else runs until this task yields.
		for i in 0..50 {
			queue.enqueue(envelope(&format!("event-{i}")));
		}
		assert_eq!(store.writes(), 0);

		queue.shutdown();
		assert_eq!(store.writes(), 1);
		assert_eq!(persisted(store.as_ref()).unwrap().len(), 50);
	}

	#[tokio::test]
	async fn test_snapshot_tracks_undelivered_events() {
		let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
		let mut slow = config(4);
		slow.retry.min_delay = Duration::from_secs(60);
		slow.retry.max_delay = Duration::from_secs(60);

		let failing = queue_with_store(slow, ScriptedTransport::always_failing(), Some(store.clone()));
		let handle = failing.enqueue(envelope("signup"));

		let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				if let Some(snapshot) = persisted(store.as_ref()) {
					if snapshot.first().map(|a| a.state) == Some(AttemptState::AwaitingRetry) {
						return snapshot;
					}
				}
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		})
		.await
		.unwrap();

		assert_eq!(snapshot.len(), 1);
		assert_eq!(snapshot[0].attempts, 1);
		assert!(snapshot[0].next_send_at.is_some());

		failing.shutdown();
		assert_eq!(handle.wait().await, DeliveryOutcome::Abandoned);

		let transport = ScriptedTransport::failing_first(0);
		let restored = queue_with_store(config(4), transport.clone(), Some(store.clone()));
		assert_eq!(restored.rehydrate(), 1);
		assert_eq!(restored.pending()[0].attempts, 1);

		tokio::time::timeout(Duration::from_secs(2), async {
			while restored.pending_len() > 0 || persisted(store.as_ref()).is_some() {
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		})
		.await
		.unwrap();

		assert_eq!(transport.requests().len(), 1);
	}

	#[tokio::test]
	async fn test_rehydrate_discards_exhausted_and_garbage() {
		let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

		let mut spent = DeliveryAttempt::new(envelope("spent"));
		spent.attempts = 4;
		store
			.set(EVENT_QUEUE_KEY, &serde_json::to_string(&vec![spent]).unwrap())
			.unwrap();
		let queue = queue_with_store(config(4), ScriptedTransport::failing_first(0), Some(store.clone()));
		assert_eq!(queue.rehydrate(), 0);
		assert_eq!(store.get(EVENT_QUEUE_KEY).unwrap(), None);

		store.set(EVENT_QUEUE_KEY, "not json").unwrap();
		assert_eq!(queue.rehydrate(), 0);
		assert_eq!(store.get(EVENT_QUEUE_KEY).unwrap(), None);
	}

	#[tokio::test]
	async fn test_shutdown_abandons_outstanding_and_later_events() {
		let mut slow = config(4);
		slow.retry.min_delay = Duration::from_secs(60);
		slow.retry.max_delay = Duration::from_secs(60);
		let transport = ScriptedTransport::always_failing();
		let queue = queue(slow, transport.clone());

		let pending = queue.enqueue(envelope("a"));
		queue.shutdown();
		assert!(queue.is_shutdown());

		assert_eq!(pending.wait().await, DeliveryOutcome::Abandoned);
		assert_eq!(
			queue.enqueue(envelope("b")).wait().await,
			DeliveryOutcome::Abandoned
		);
		assert!(transport.requests().is_empty());
		assert_eq!(queue.flush().await.unwrap(), 0);
	}
}
