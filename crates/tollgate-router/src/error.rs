// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::IpAddr;
use thiserror::Error;
use tollgate_wgtunnel_common::{IpError, KeyError};

#[derive(Debug, Error)]
pub enum RouterError {
	#[error("configuration error: {0}")]
	Config(#[from] crate::config::ConfigError),

	#[error("tunnel driver error: {0}")]
	Driver(#[from] DriverError),

	#[error("address allocation failed: {0}")]
	Allocation(#[from] IpError),

	#[error("no peer bound to {0}")]
	NotFound(IpAddr),

	#[error("firewall error: {0}")]
	Firewall(#[from] FirewallError),

	#[error("key error: {0}")]
	Key(#[from] KeyError),

	#[error("failed to read private key {path}: {source}")]
	PrivateKey {
		path: std::path::PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("blocking task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// Failures talking to the WireGuard device.
#[derive(Debug, Error)]
pub enum DriverError {
	#[error("invalid interface name {name:?}: {message}")]
	InvalidInterface { name: String, message: String },

	#[error("device {name} unavailable: {source}")]
	Unavailable {
		name: String,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to apply configuration to {name}: {source}")]
	Apply {
		name: String,
		#[source]
		source: std::io::Error,
	},

	#[error("device {name} reports no {field}")]
	Incomplete { name: String, field: &'static str },

	#[error("driver rejected key: {0}")]
	InvalidKey(String),

	#[error("command `{command}` failed: {message}")]
	Command { command: String, message: String },
}

#[derive(Debug, Error)]
pub enum FirewallError {
	#[error("rule command `{command}` failed: {message}")]
	Rule { command: String, message: String },

	#[error("failed to spawn {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("XDP program error: {0}")]
	Xdp(String),

	#[error("XDP object {path} failed integrity check: expected {expected}, got {actual}")]
	Integrity {
		path: String,
		expected: String,
		actual: String,
	},

	#[error("XDP object unreadable: {0}")]
	Io(#[from] std::io::Error),

	#[error("XDP program not loaded")]
	NotLoaded,
}

pub type Result<T> = std::result::Result<T, RouterError>;
