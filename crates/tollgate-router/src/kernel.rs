// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kernel WireGuard driver backed by `wireguard-control`.

use crate::driver::{DeviceSpec, DeviceState, DriverResult, PeerUpdate, TunnelDriver};
use crate::error::DriverError;
use ipnet::IpNet;
use std::io;
use std::process::Command;
use tollgate_wgtunnel_common::{host_prefix, PeerState, WgPublicKey};
use tracing::{debug, info};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

pub struct KernelDriver {
	name: String,
	iface: InterfaceName,
	backend: Backend,
}

impl KernelDriver {
	pub fn new(name: &str) -> DriverResult<Self> {
		let iface: InterfaceName = name.parse().map_err(|e| DriverError::InvalidInterface {
			name: name.to_string(),
			message: format!("{e:?}"),
		})?;

		Ok(Self {
			name: name.to_string(),
			iface,
			backend: Backend::Kernel,
		})
	}

	fn open(&self) -> DriverResult<Device> {
		Device::get(&self.iface, self.backend).map_err(|source| DriverError::Unavailable {
			name: self.name.clone(),
			source,
		})
	}

	fn push(&self, update: DeviceUpdate) -> DriverResult<()> {
		update
			.apply(&self.iface, self.backend)
			.map_err(|source| DriverError::Apply {
				name: self.name.clone(),
				source,
			})
	}

	fn ip(&self, args: &[&str]) -> DriverResult<()> {
		let command = format!("ip {}", args.join(" "));
		let output = Command::new("ip")
			.args(args)
			.output()
			.map_err(|e| DriverError::Command {
				command: command.clone(),
				message: e.to_string(),
			})?;

		if !output.status.success() {
			return Err(DriverError::Command {
				command,
				message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		debug!(%command, "ran ip command");
		Ok(())
	}
}

const ENODEV: i32 = 19;

/// Netlink reports a missing interface as ENODEV, the userspace backend as
/// a missing socket.
fn is_absent(e: &io::Error) -> bool {
	e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(ENODEV)
}

fn to_driver_key(key: &WgPublicKey) -> Key {
	Key(*key.as_bytes())
}

fn from_driver_key(key: &Key) -> WgPublicKey {
	WgPublicKey::from_bytes(key.0)
}

impl TunnelDriver for KernelDriver {
	fn name(&self) -> &str {
		&self.name
	}

	fn device(&self) -> DriverResult<DeviceState> {
		let device = self.open()?;

		let public_key = device
			.public_key
			.as_ref()
			.map(from_driver_key)
			.ok_or_else(|| DriverError::Incomplete {
				name: self.name.clone(),
				field: "public key",
			})?;

		let peers = device
			.peers
			.iter()
			.map(|info| {
				let config = &info.config;
				PeerState {
					public_key: from_driver_key(&config.public_key),
					endpoint: config.endpoint,
					allowed_ips: config
						.allowed_ips
						.iter()
						.filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
						.collect(),
				}
			})
			.collect();

		Ok(DeviceState {
			public_key,
			listen_port: device.listen_port.unwrap_or(0),
			peers,
		})
	}

	fn apply(&self, update: PeerUpdate) -> DriverResult<()> {
		let update = match update {
			PeerUpdate::Upsert {
				public_key,
				address,
			} => {
				let peer = PeerConfigBuilder::new(&to_driver_key(&public_key))
					.replace_allowed_ips()
					.add_allowed_ip(address, host_prefix(address));
				DeviceUpdate::new().add_peer(peer)
			}
			PeerUpdate::Remove { public_key } => {
				DeviceUpdate::new().remove_peer_by_key(&to_driver_key(&public_key))
			}
		};
		self.push(update)
	}

	fn create_device(&self, spec: &DeviceSpec) -> DriverResult<()> {
		let private_key = Key::from_base64(&spec.private_key.expose_base64())
			.map_err(|e| DriverError::InvalidKey(format!("{e:?}")))?;

		self.push(
			DeviceUpdate::new()
				.set_private_key(private_key)
				.set_listen_port(spec.listen_port),
		)?;

		let address = spec.address.to_string();
		self.ip(&["address", "replace", &address, "dev", &self.name])?;
		self.ip(&["link", "set", "dev", &self.name, "up"])?;

		info!(device = %self.name, %address, listen_port = spec.listen_port, "created WireGuard device");
		Ok(())
	}

	fn delete_device(&self) -> DriverResult<()> {
		let device = match Device::get(&self.iface, self.backend) {
			Ok(device) => device,
			Err(e) if is_absent(&e) => {
				debug!(device = %self.name, "device already gone");
				return Ok(());
			}
			Err(source) => {
				return Err(DriverError::Unavailable {
					name: self.name.clone(),
					source,
				})
			}
		};

		match device.delete() {
			Ok(()) => info!(device = %self.name, "deleted WireGuard device"),
			Err(e) if is_absent(&e) => debug!(device = %self.name, "device vanished before delete"),
			Err(source) => {
				return Err(DriverError::Apply {
					name: self.name.clone(),
					source,
				})
			}
		}
		Ok(())
	}
}
