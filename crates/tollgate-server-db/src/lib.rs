// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Storage for the gateway's admin accounts, registration tokens and
//! devices.

pub mod admin;
mod argon2_config;
pub mod devices;
pub mod error;
pub mod pool;
pub mod registration;

#[cfg(test)]
pub(crate) mod testing;

pub use admin::{AdminRepository, AdminUser};
pub use devices::{Device, DeviceRepository};
pub use error::{DbError, Result};
pub use pool::create_pool;
pub use registration::{RegistrationRepository, RegistrationToken};
pub use sqlx::sqlite::SqlitePool;

use chrono::{DateTime, Utc};

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|t| t.with_timezone(&Utc))
		.map_err(|e| DbError::Internal(format!("bad {column} timestamp {value:?}: {e}")))
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
	matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
