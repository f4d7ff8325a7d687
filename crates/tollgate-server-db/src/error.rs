// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

/// `InvalidCredentials` covers both an unknown admin and a wrong password.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Rejected input: {0}")]
	Invalid(String),

	#[error("Invalid username or password")]
	InvalidCredentials,

	#[error("Admin account {0} is locked")]
	Locked(String),

	#[error("Internal: {0}")]
	Internal(String),

	#[error("Malformed JSON column: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
