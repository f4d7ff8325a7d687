// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! One-shot registration tokens that let a user enrol (or re-enrol) a device.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::is_unique_violation;

pub const MIN_TOKEN_LEN: usize = 32;

/// Lookups never answer faster than this, hit or miss.
pub const DEFAULT_LOOKUP_FLOOR: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationToken {
	pub token: String,
	pub username: String,
	/// Address of the device this token re-enrols, if any.
	pub overwrites: Option<String>,
	#[serde(default)]
	pub groups: Vec<String>,
}

type TokenRow = (String, String, Option<String>, Option<String>);

fn from_row((token, username, overwrite, groups): TokenRow) -> Result<RegistrationToken> {
	let groups = match groups {
		Some(json) => serde_json::from_str(&json)?,
		None => Vec::new(),
	};
	Ok(RegistrationToken {
		token,
		username,
		overwrites: overwrite.filter(|o| !o.is_empty()),
		groups,
	})
}

pub fn validate_token(token: &str) -> Result<()> {
	if token.len() < MIN_TOKEN_LEN {
		return Err(DbError::Invalid(format!(
			"registration token is too short (minimum {MIN_TOKEN_LEN} characters)"
		)));
	}
	if !token
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
	{
		return Err(DbError::Invalid(
			"registration token contains illegal characters (allowed: a-z A-Z 0-9 - . _)".to_string(),
		));
	}
	Ok(())
}

#[derive(Clone)]
pub struct RegistrationRepository {
	pool: SqlitePool,
	lookup_floor: Duration,
}

impl RegistrationRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self {
			pool,
			lookup_floor: DEFAULT_LOOKUP_FLOOR,
		}
	}

	pub fn with_lookup_floor(mut self, floor: Duration) -> Self {
		self.lookup_floor = floor;
		self
	}

	pub fn lookup_floor(&self) -> Duration {
		self.lookup_floor
	}

	/// Looks a token up. Takes at least the lookup floor whether or not the
	/// token exists.
	#[tracing::instrument(skip(self, token))]
	pub async fn get(&self, token: &str) -> Result<RegistrationToken> {
		let query = sqlx::query_as::<_, TokenRow>(
			"SELECT token, username, overwrite, groups
			 FROM registration_tokens WHERE token = ?",
		)
		.bind(token)
		.fetch_optional(&self.pool);

		let (row, ()) = tokio::join!(query, tokio::time::sleep(self.lookup_floor));

		match row? {
			Some(row) => from_row(row),
			None => Err(DbError::NotFound("registration token".to_string())),
		}
	}

	/// All outstanding tokens, newest first.
	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<RegistrationToken>> {
		let rows: Vec<TokenRow> = sqlx::query_as(
			"SELECT token, username, overwrite, groups
			 FROM registration_tokens ORDER BY rowid DESC",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(from_row).collect()
	}

	/// Deletes by token, or every token issued to a username.
	#[tracing::instrument(skip(self, identifier))]
	pub async fn delete(&self, identifier: &str) -> Result<u64> {
		let result =
			sqlx::query("DELETE FROM registration_tokens WHERE token = ?1 OR username = ?1")
				.bind(identifier)
				.execute(&self.pool)
				.await?;

		Ok(result.rows_affected())
	}

	/// Issues a random token (32 bytes, hex) for `username`.
	#[tracing::instrument(skip(self, groups), fields(%username))]
	pub async fn generate(
		&self,
		username: &str,
		overwrites: Option<&str>,
		groups: &[String],
	) -> Result<String> {
		let mut bytes = [0u8; 32];
		OsRng.fill_bytes(&mut bytes);
		let token = hex::encode(bytes);

		self.add(&token, username, overwrites, groups).await?;
		Ok(token)
	}

	/// Stores a caller-chosen token. An `overwrites` address must belong to
	/// a device already enrolled by `username`.
	#[tracing::instrument(skip(self, token, groups), fields(%username))]
	pub async fn add(
		&self,
		token: &str,
		username: &str,
		overwrites: Option<&str>,
		groups: &[String],
	) -> Result<()> {
		validate_token(token)?;

		let overwrites = overwrites.filter(|o| !o.is_empty());
		if let Some(address) = overwrites {
			let owned: Option<(String,)> =
				sqlx::query_as("SELECT address FROM devices WHERE address = ? AND username = ?")
					.bind(address)
					.bind(username)
					.fetch_optional(&self.pool)
					.await?;
			if owned.is_none() {
				return Err(DbError::NotFound(format!(
					"device {address} owned by {username} to overwrite"
				)));
			}
		}

		let groups = if groups.is_empty() {
			None
		} else {
			Some(serde_json::to_string(groups)?)
		};

		sqlx::query(
			"INSERT INTO registration_tokens (token, username, overwrite, groups)
			 VALUES (?, ?, ?, ?)",
		)
		.bind(token)
		.bind(username)
		.bind(overwrites)
		.bind(groups)
		.execute(&self.pool)
		.await
		.map_err(|e| {
			if is_unique_violation(&e) {
				DbError::Conflict("registration token already exists".to_string())
			} else {
				DbError::Sqlx(e)
			}
		})?;

		tracing::info!("registration token created");
		Ok(())
	}
}
