// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Calls recorded before the client exists.
//!
//! Application code can start tracking while configuration is still being
//! loaded. Calls go into a [`CommandBuffer`]; once the client is built the
//! buffer is replayed against it exactly once, oldest call first.

use std::collections::VecDeque;

use hyperengage_core::EventType;
use tracing::{debug, warn};

use crate::client::{AccountIdentity, Dispatch, HyperengageClient, TrackOptions, UserIdentity};
use crate::delivery::DeliveryHandle;
use crate::error::Result;

/// Default number of commands kept before the oldest is dropped.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1000;

/// A deferred client call.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
	Track {
		event_type: EventType,
		options: TrackOptions,
	},
	IdentifyUser(UserIdentity),
	User(UserIdentity, Dispatch),
	Account(AccountIdentity, Dispatch),
}

impl Command {
	fn name(&self) -> &str {
		match self {
			Command::Track { event_type, .. } => event_type.as_str(),
			Command::IdentifyUser(_) => "identify_user",
			Command::User(..) => "user",
			Command::Account(..) => "account",
		}
	}

	fn apply(self, client: &HyperengageClient) -> Result<Option<DeliveryHandle>> {
		match self {
			Command::Track {
				event_type,
				options,
			} => client.track(event_type, options).map(Some),
			Command::IdentifyUser(identity) => client.identify_user(identity).map(Some),
			Command::User(identity, dispatch) => client.user(identity, dispatch),
			Command::Account(identity, dispatch) => client.account(identity, dispatch),
		}
	}
}

/// Bounded FIFO of [`Command`]s.
#[derive(Debug)]
pub struct CommandBuffer {
	commands: VecDeque<Command>,
	capacity: usize,
}

impl CommandBuffer {
	/// Creates a buffer holding at most `capacity` commands (at least one).
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			commands: VecDeque::with_capacity(capacity.min(64)),
			capacity,
		}
	}

	/// Records a command, dropping and returning the oldest when full.
	pub fn push(&mut self, command: Command) -> Option<Command> {
		let dropped = if self.commands.len() >= self.capacity {
			self.commands.pop_front()
		} else {
			None
		};

		if let Some(dropped) = &dropped {
			warn!(
				command = dropped.name(),
				capacity = self.capacity,
				"Dropped buffered command due to overflow"
			);
		}

		self.commands.push_back(command);
		dropped
	}

	pub fn track(&mut self, event_type: impl Into<EventType>, options: TrackOptions) -> Option<Command> {
		self.push(Command::Track {
			event_type: event_type.into(),
			options,
		})
	}

	pub fn identify_user(&mut self, identity: UserIdentity) -> Option<Command> {
		self.push(Command::IdentifyUser(identity))
	}

	pub fn user(&mut self, identity: UserIdentity, dispatch: Dispatch) -> Option<Command> {
		self.push(Command::User(identity, dispatch))
	}

	pub fn account(&mut self, identity: AccountIdentity, dispatch: Dispatch) -> Option<Command> {
		self.push(Command::Account(identity, dispatch))
	}

	pub fn len(&self) -> usize {
		self.commands.len()
	}

	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Applies every command to `client` in the order it was recorded.
	///
	/// Consumes the buffer, so nothing can be replayed twice. Returns one
	/// result per command; a failing command does not stop the rest.
	pub fn replay(self, client: &HyperengageClient) -> Vec<Result<Option<DeliveryHandle>>> {
		debug!(count = self.commands.len(), "Replaying buffered commands");
		self
			.commands
			.into_iter()
			.map(|command| command.apply(client))
			.collect()
	}
}

impl Default for CommandBuffer {
	fn default() -> Self {
		Self::new(DEFAULT_COMMAND_CAPACITY)
	}
}
