// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The seam between the gateway and the WireGuard device.
//!
//! Driver calls block on netlink or the userspace socket, so callers run them
//! on the blocking pool. Nothing outside [`crate::controller`] holds a driver.

use crate::error::DriverError;
use std::net::IpAddr;
use tollgate_wgtunnel_common::{PeerState, WgPrivateKey, WgPublicKey};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A snapshot of the device as the driver reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
	pub public_key: WgPublicKey,
	pub listen_port: u16,
	/// Peers in driver order.
	pub peers: Vec<PeerState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
	/// Create the peer, or replace its allowed IPs with exactly `address`.
	Upsert {
		public_key: WgPublicKey,
		address: IpAddr,
	},
	Remove {
		public_key: WgPublicKey,
	},
}

/// What we need to create a device we own.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
	pub private_key: WgPrivateKey,
	pub listen_port: u16,
	/// Gateway address with the tunnel prefix, e.g. `10.0.0.1/24`.
	pub address: ipnet::IpNet,
}

pub trait TunnelDriver: Send + Sync {
	fn name(&self) -> &str;

	fn device(&self) -> DriverResult<DeviceState>;

	fn apply(&self, update: PeerUpdate) -> DriverResult<()>;

	fn create_device(&self, spec: &DeviceSpec) -> DriverResult<()>;

	/// Deleting a device that does not exist succeeds.
	fn delete_device(&self) -> DriverResult<()>;
}
