// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

// Every in-memory connection is its own database, so keep exactly one.
pub async fn create_test_pool() -> SqlitePool {
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.unwrap()
}

pub async fn create_devices_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS devices (
			address TEXT PRIMARY KEY,
			public_key TEXT NOT NULL UNIQUE,
			username TEXT NOT NULL,
			locked INTEGER NOT NULL DEFAULT 0,
			created_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_registration_tokens_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS registration_tokens (
			token TEXT PRIMARY KEY,
			username TEXT NOT NULL,
			overwrite TEXT,
			groups TEXT
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_admin_users_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS admin_users (
			username TEXT PRIMARY KEY,
			passwd_hash TEXT NOT NULL,
			locked TEXT,
			last_login TEXT,
			ip TEXT,
			date_added TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_all_tables(pool: &SqlitePool) {
	create_devices_table(pool).await;
	create_registration_tokens_table(pool).await;
	create_admin_users_table(pool).await;
}
