// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Key-value persistence capability.
//!
//! The SDK persists two things: the anonymous id and, optionally, a snapshot
//! of undelivered events. The host decides where they live by supplying a
//! [`KeyValueStore`]; the SDK ships an in-memory store and a directory-backed
//! file store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Synchronous string storage, the shape of a cookie jar or `localStorage`.
///
/// Calls are short and are made from both async tasks and blocking flushes,
/// so the trait is deliberately synchronous.
pub trait KeyValueStore: Send + Sync {
	fn get(&self, key: &str) -> Result<Option<String>>;
	fn set(&self, key: &str, value: &str) -> Result<()>;
	fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store; values are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
	values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.values.lock().get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<()> {
		self.values.lock().insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<()> {
		self.values.lock().remove(key);
		Ok(())
	}
}

/// Stores each key as a file in a directory.
///
/// Writes go through a temporary file and a rename so a crash mid-write
/// never leaves a truncated value behind.
#[derive(Debug)]
pub struct FileStore {
	dir: PathBuf,
}

impl FileStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	/// Opens a store under the platform data directory (`$XDG_DATA_HOME/hyperengage`).
	pub fn from_xdg() -> Result<Self> {
		let data_dir = dirs::data_dir().ok_or_else(|| CoreError::Storage {
			path: PathBuf::from("$XDG_DATA_HOME"),
			source: std::io::Error::new(
				std::io::ErrorKind::NotFound,
				"could not determine XDG data directory",
			),
		})?;

		Self::open(data_dir.join("hyperengage"))
	}

	/// Opens a store in `dir`, creating the directory if needed.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir).map_err(|source| CoreError::Storage {
			path: dir.clone(),
			source,
		})?;

		info!(dir = %dir.display(), "initialized file store");

		Ok(Self::new(dir))
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> Result<PathBuf> {
		let valid = !key.is_empty()
			&& key
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
			&& !key.starts_with('.');
		if !valid {
			return Err(CoreError::InvalidStorageKey(key.to_string()));
		}
		Ok(self.dir.join(key))
	}
}

impl KeyValueStore for FileStore {
	fn get(&self, key: &str) -> Result<Option<String>> {
		let path = self.path_for(key)?;
		match std::fs::read_to_string(&path) {
			Ok(value) => Ok(Some(value)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(source) => Err(CoreError::Storage { path, source }),
		}
	}

	fn set(&self, key: &str, value: &str) -> Result<()> {
		let path = self.path_for(key)?;
		let tmp_path = self.dir.join(format!(".{key}.tmp"));

		let io = |path: &Path| {
			let path = path.to_path_buf();
			move |source| CoreError::Storage { path, source }
		};

		std::fs::create_dir_all(&self.dir).map_err(io(&self.dir))?;
		std::fs::write(&tmp_path, value).map_err(io(&tmp_path))?;
		std::fs::rename(&tmp_path, &path).map_err(io(&path))?;

		debug!(key, path = %path.display(), "stored value");
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<()> {
		let path = self.path_for(key)?;
		match std::fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(source) => Err(CoreError::Storage { path, source }),
		}
	}
}
