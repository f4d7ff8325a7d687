// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Enrolled devices: one row per tunnel address.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::net::IpAddr;

use crate::error::{DbError, Result};
use crate::{is_unique_violation, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
	pub address: IpAddr,
	pub public_key: String,
	pub username: String,
	pub locked: bool,
	pub created_at: DateTime<Utc>,
}

type DeviceRow = (String, String, String, bool, String);

fn from_row((address, public_key, username, locked, created_at): DeviceRow) -> Result<Device> {
	Ok(Device {
		address: address
			.parse()
			.map_err(|_| DbError::Internal(format!("bad device address {address:?}")))?,
		public_key,
		username,
		locked,
		created_at: parse_timestamp("created_at", &created_at)?,
	})
}

#[derive(Clone)]
pub struct DeviceRepository {
	pool: SqlitePool,
}

impl DeviceRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, public_key), fields(%address, %username))]
	pub async fn insert(&self, address: IpAddr, public_key: &str, username: &str) -> Result<Device> {
		let created_at = Utc::now();
		sqlx::query(
			"INSERT INTO devices (address, public_key, username, locked, created_at)
			 VALUES (?, ?, ?, 0, ?)",
		)
		.bind(address.to_string())
		.bind(public_key)
		.bind(username)
		.bind(created_at.to_rfc3339())
		.execute(&self.pool)
		.await
		.map_err(|e| {
			if is_unique_violation(&e) {
				DbError::Conflict(format!("device {address} or its key is already enrolled"))
			} else {
				DbError::Sqlx(e)
			}
		})?;

		tracing::info!("device enrolled");
		self.get_by_address(address)
			.await?
			.ok_or_else(|| DbError::Internal(format!("device {address} vanished after insert")))
	}

	#[tracing::instrument(skip(self), fields(%address))]
	pub async fn get_by_address(&self, address: IpAddr) -> Result<Option<Device>> {
		let row: Option<DeviceRow> = sqlx::query_as(
			"SELECT address, public_key, username, locked, created_at
			 FROM devices WHERE address = ?",
		)
		.bind(address.to_string())
		.fetch_optional(&self.pool)
		.await?;

		row.map(from_row).transpose()
	}

	/// Devices newest first, optionally only those owned by `username`.
	#[tracing::instrument(skip(self))]
	pub async fn list(&self, username: Option<&str>) -> Result<Vec<Device>> {
		let rows: Vec<DeviceRow> = match username {
			Some(username) => {
				sqlx::query_as(
					"SELECT address, public_key, username, locked, created_at
					 FROM devices WHERE username = ? ORDER BY rowid DESC",
				)
				.bind(username)
				.fetch_all(&self.pool)
				.await?
			}
			None => {
				sqlx::query_as(
					"SELECT address, public_key, username, locked, created_at
					 FROM devices ORDER BY rowid DESC",
				)
				.fetch_all(&self.pool)
				.await?
			}
		};

		rows.into_iter().map(from_row).collect()
	}

	#[tracing::instrument(skip(self), fields(%address))]
	pub async fn delete(&self, address: IpAddr) -> Result<u64> {
		let result = sqlx::query("DELETE FROM devices WHERE address = ?")
			.bind(address.to_string())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%address, locked))]
	pub async fn set_locked(&self, address: IpAddr, locked: bool) -> Result<()> {
		let result = sqlx::query("UPDATE devices SET locked = ? WHERE address = ?")
			.bind(locked)
			.bind(address.to_string())
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("device {address}")));
		}
		Ok(())
	}

	/// Whether the device bound to `address` exists and is not locked.
	pub async fn is_usable(&self, address: IpAddr) -> Result<bool> {
		Ok(self
			.get_by_address(address)
			.await?
			.is_some_and(|device| !device.locked))
	}
}
