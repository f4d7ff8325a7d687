// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host firewall surfaces: the baseline iptables rule group and the
//! per-device authorization state held by the XDP program.

pub mod rules;
pub mod xdp;

use crate::error::FirewallError;
use async_trait::async_trait;
use std::net::IpAddr;

pub use rules::{baseline_rules, FirewallBaseline, IptablesBackend, Rule, RuleBackend};
pub use xdp::XdpFirewall;

pub type FirewallResult<T> = std::result::Result<T, FirewallError>;

/// Session metadata attached to an authorized device. Both deadlines are
/// absolute, in seconds on the kernel's monotonic clock; zero disables them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
	pub session_expiry: u64,
	pub max_idle: u64,
}

/// Per-device packet admission. Every allocated address has an entry;
/// entries start unauthorized.
#[async_trait]
pub trait DeviceFirewall: Send + Sync {
	async fn load(&self) -> FirewallResult<()>;

	/// Detaches the program. Pinned maps stay behind. Calling it when
	/// nothing is loaded is a no-op.
	async fn unload(&self) -> FirewallResult<()>;

	/// Pins the device map so authorization state outlives the process.
	async fn pin(&self) -> FirewallResult<()>;

	/// Removes pinned maps. Missing pins are not an error.
	async fn unpin(&self) -> FirewallResult<()>;

	async fn add_device(&self, address: IpAddr) -> FirewallResult<()>;

	async fn remove_device(&self, address: IpAddr) -> FirewallResult<()>;

	async fn authorize(&self, address: IpAddr, session: SessionState) -> FirewallResult<()>;

	/// Drops the device back to unauthorized without removing it.
	async fn deauthenticate(&self, address: IpAddr) -> FirewallResult<()>;

	async fn is_authorized(&self, address: IpAddr) -> FirewallResult<bool>;
}
