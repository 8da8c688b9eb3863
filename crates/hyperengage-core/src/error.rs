// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the core SDK types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by storage.
#[derive(Debug, Error)]
pub enum CoreError {
	/// Reading or writing a persisted value failed.
	#[error("storage error at {path}: {source}")]
	Storage {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// A storage key contained characters that cannot be mapped to a file name.
	#[error("invalid storage key: {0}")]
	InvalidStorageKey(String),
}

/// A specialized `Result` type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
