// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Admin accounts for the management interface.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use crate::argon2_config::argon2_instance;
use crate::error::{DbError, Result};
use crate::{is_unique_violation, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
	pub username: String,
	pub locked_at: Option<DateTime<Utc>>,
	pub date_added: DateTime<Utc>,
	pub last_login: Option<DateTime<Utc>>,
	pub last_login_ip: Option<String>,
}

impl AdminUser {
	pub fn is_locked(&self) -> bool {
		self.locked_at.is_some()
	}
}

type AdminRow = (String, Option<String>, Option<String>, Option<String>, String);

fn from_row((username, locked, last_login, ip, date_added): AdminRow) -> Result<AdminUser> {
	Ok(AdminUser {
		username,
		locked_at: locked.map(|t| parse_timestamp("locked", &t)).transpose()?,
		date_added: parse_timestamp("date_added", &date_added)?,
		last_login: last_login
			.map(|t| parse_timestamp("last_login", &t))
			.transpose()?,
		last_login_ip: ip,
	})
}

fn hash_password(password: &str) -> Result<String> {
	let salt = SaltString::generate(&mut OsRng);
	argon2_instance()
		.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|e| DbError::Internal(format!("failed to hash password: {e}")))
}

#[derive(Clone)]
pub struct AdminRepository {
	pool: SqlitePool,
}

impl AdminRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, password), fields(%username))]
	pub async fn create(&self, username: &str, password: &str) -> Result<()> {
		let hash = hash_password(password)?;

		sqlx::query(
			"INSERT INTO admin_users (username, passwd_hash, date_added)
			 VALUES (?, ?, ?)",
		)
		.bind(username)
		.bind(hash)
		.bind(Utc::now().to_rfc3339())
		.execute(&self.pool)
		.await
		.map_err(|e| {
			if is_unique_violation(&e) {
				DbError::Conflict(format!("admin user {username}"))
			} else {
				DbError::Sqlx(e)
			}
		})?;

		tracing::info!("admin user created");
		Ok(())
	}

	/// Checks a login attempt. The password is verified before the lock is
	/// consulted, so a locked account still costs a full hash.
	#[tracing::instrument(skip(self, password), fields(%username))]
	pub async fn compare(&self, username: &str, password: &str) -> Result<()> {
		let row: Option<(String, Option<String>)> =
			sqlx::query_as("SELECT passwd_hash, locked FROM admin_users WHERE username = ?")
				.bind(username)
				.fetch_optional(&self.pool)
				.await?;

		let Some((stored, locked)) = row else {
			return Err(DbError::InvalidCredentials);
		};

		let parsed = PasswordHash::new(&stored)
			.map_err(|e| DbError::Internal(format!("stored hash for {username} is malformed: {e}")))?;
		argon2_instance()
			.verify_password(password.as_bytes(), &parsed)
			.map_err(|_| DbError::InvalidCredentials)?;

		if locked.is_some() {
			return Err(DbError::Locked(username.to_string()));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%username, locked))]
	pub async fn set_locked(&self, username: &str, locked: bool) -> Result<()> {
		let locked_at = locked.then(|| Utc::now().to_rfc3339());
		let result = sqlx::query("UPDATE admin_users SET locked = ? WHERE username = ?")
			.bind(locked_at)
			.bind(username)
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("admin user {username}")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%username))]
	pub async fn delete(&self, username: &str) -> Result<u64> {
		let result = sqlx::query("DELETE FROM admin_users WHERE username = ?")
			.bind(username)
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%username))]
	pub async fn get(&self, username: &str) -> Result<Option<AdminUser>> {
		let row: Option<AdminRow> = sqlx::query_as(
			"SELECT username, locked, last_login, ip, date_added
			 FROM admin_users WHERE username = ?",
		)
		.bind(username)
		.fetch_optional(&self.pool)
		.await?;

		row.map(from_row).transpose()
	}

	/// Every admin, newest first.
	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<AdminUser>> {
		let rows: Vec<AdminRow> = sqlx::query_as(
			"SELECT username, locked, last_login, ip, date_added
			 FROM admin_users ORDER BY rowid DESC",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(from_row).collect()
	}

	#[tracing::instrument(skip(self, password), fields(%username))]
	pub async fn set_password(&self, username: &str, password: &str) -> Result<()> {
		let hash = hash_password(password)?;
		let result = sqlx::query("UPDATE admin_users SET passwd_hash = ? WHERE username = ?")
			.bind(hash)
			.bind(username)
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("admin user {username}")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%username, %ip))]
	pub async fn set_last_login(&self, username: &str, ip: &str) -> Result<()> {
		let result = sqlx::query("UPDATE admin_users SET last_login = ?, ip = ? WHERE username = ?")
			.bind(Utc::now().to_rfc3339())
			.bind(ip)
			.bind(username)
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("admin user {username}")));
		}
		Ok(())
	}
}
