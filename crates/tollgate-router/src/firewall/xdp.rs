// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{DeviceFirewall, FirewallResult, SessionState};
use crate::config::XdpConfig;
use crate::error::FirewallError;
use async_trait::async_trait;
use aya::maps::{HashMap as BpfHashMap, MapData, MapError};
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader, Pod};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const PROGRAM_NAME: &str = "xdp_tollgate";
const DEVICES_MAP: &str = "DEVICES";

/// Value stored per tunnel address in the devices map. Layout is shared with
/// the XDP program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceEntry {
	pub authorized: u32,
	pub _pad: u32,
	pub session_expiry: u64,
	pub max_idle: u64,
	pub last_packet: u64,
}

// SAFETY: repr(C), plain integers, no padding the kernel could leak into.
unsafe impl Pod for DeviceEntry {}

impl DeviceEntry {
	fn authorized(session: SessionState) -> Self {
		Self {
			authorized: 1,
			session_expiry: session.session_expiry,
			max_idle: session.max_idle,
			..Self::default()
		}
	}
}

/// Map key: the address in IPv6 form, IPv4 mapped into `::ffff:0:0/96`.
pub fn map_key(address: IpAddr) -> [u8; 16] {
	match address {
		IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
		IpAddr::V6(v6) => v6.octets(),
	}
}

/// Checks the object file against an expected hex SHA-256.
pub fn verify_object(bytecode: &[u8], path: &Path, expected: Option<&str>) -> FirewallResult<()> {
	let Some(expected) = expected else {
		warn!(path = %path.display(), "no XDP object digest configured, skipping integrity check");
		return Ok(());
	};

	let actual = hex::encode(Sha256::digest(bytecode));
	if !actual.eq_ignore_ascii_case(expected) {
		return Err(FirewallError::Integrity {
			path: path.display().to_string(),
			expected: expected.to_string(),
			actual,
		});
	}

	info!("XDP object integrity verified");
	Ok(())
}

fn map_err(e: MapError) -> FirewallError {
	FirewallError::Xdp(e.to_string())
}

/// Per-device admission through an XDP program attached to the tunnel
/// interface.
pub struct XdpFirewall {
	config: XdpConfig,
	interface: String,
	loaded: Mutex<Option<Ebpf>>,
}

impl XdpFirewall {
	pub fn new(config: XdpConfig, interface: &str) -> Self {
		Self {
			config,
			interface: interface.to_string(),
			loaded: Mutex::new(None),
		}
	}

	fn attach(&self, bytecode: &[u8]) -> FirewallResult<Ebpf> {
		std::fs::create_dir_all(&self.config.pin_path)?;

		let mut bpf = EbpfLoader::new()
			.map_pin_path(&self.config.pin_path)
			.load(bytecode)
			.map_err(|e| FirewallError::Xdp(format!("failed to load object: {e}")))?;

		let program: &mut Xdp = bpf
			.program_mut(PROGRAM_NAME)
			.ok_or_else(|| FirewallError::Xdp(format!("program {PROGRAM_NAME} not found")))?
			.try_into()
			.map_err(|e| FirewallError::Xdp(format!("{PROGRAM_NAME} is not an XDP program: {e}")))?;

		program
			.load()
			.map_err(|e| FirewallError::Xdp(format!("kernel rejected {PROGRAM_NAME}: {e}")))?;
		program
			.attach(&self.interface, XdpFlags::default())
			.map_err(|e| FirewallError::Xdp(format!("failed to attach to {}: {e}", self.interface)))?;

		Ok(bpf)
	}

	async fn with_devices<T, F>(&self, f: F) -> FirewallResult<T>
	where
		F: FnOnce(&mut BpfHashMap<&mut MapData, [u8; 16], DeviceEntry>) -> FirewallResult<T>,
	{
		let mut loaded = self.loaded.lock().await;
		let bpf = loaded.as_mut().ok_or(FirewallError::NotLoaded)?;
		let map = bpf
			.map_mut(DEVICES_MAP)
			.ok_or_else(|| FirewallError::Xdp(format!("map {DEVICES_MAP} not found")))?;
		let mut devices = BpfHashMap::try_from(map).map_err(map_err)?;
		f(&mut devices)
	}
}

#[async_trait]
impl DeviceFirewall for XdpFirewall {
	#[instrument(skip(self), fields(interface = %self.interface, path = %self.config.object_path.display()))]
	async fn load(&self) -> FirewallResult<()> {
		let mut loaded = self.loaded.lock().await;
		if loaded.is_some() {
			return Ok(());
		}

		let bytecode = std::fs::read(&self.config.object_path)?;
		verify_object(
			&bytecode,
			&self.config.object_path,
			self.config.object_sha256.as_deref(),
		)?;

		*loaded = Some(self.attach(&bytecode)?);
		info!("XDP program attached");
		Ok(())
	}

	#[instrument(skip(self), fields(interface = %self.interface))]
	async fn unload(&self) -> FirewallResult<()> {
		// Dropping the handle detaches the program.
		if self.loaded.lock().await.take().is_some() {
			info!("XDP program detached");
		}
		Ok(())
	}

	#[instrument(skip(self), fields(path = %self.config.pin_path.display()))]
	async fn pin(&self) -> FirewallResult<()> {
		let loaded = self.loaded.lock().await;
		let bpf = loaded.as_ref().ok_or(FirewallError::NotLoaded)?;

		let target = self.config.pin_path.join(DEVICES_MAP);
		if target.exists() {
			debug!("device map already pinned");
			return Ok(());
		}

		std::fs::create_dir_all(&self.config.pin_path)?;
		let map = bpf
			.map(DEVICES_MAP)
			.ok_or_else(|| FirewallError::Xdp(format!("map {DEVICES_MAP} not found")))?;
		map.pin(&target)
			.map_err(|e| FirewallError::Xdp(format!("failed to pin {DEVICES_MAP}: {e}")))?;

		info!("device map pinned");
		Ok(())
	}

	#[instrument(skip(self), fields(path = %self.config.pin_path.display()))]
	async fn unpin(&self) -> FirewallResult<()> {
		let pin_path = &self.config.pin_path;
		if pin_path.is_dir() {
			std::fs::remove_dir_all(pin_path)?;
		} else if pin_path.exists() {
			std::fs::remove_file(pin_path)?;
		} else {
			return Ok(());
		}
		debug!("removed pinned maps");
		Ok(())
	}

	async fn add_device(&self, address: IpAddr) -> FirewallResult<()> {
		self.with_devices(|devices| {
			devices
				.insert(map_key(address), DeviceEntry::default(), 0)
				.map_err(map_err)
		})
		.await?;
		debug!(%address, "added device to XDP map");
		Ok(())
	}

	async fn remove_device(&self, address: IpAddr) -> FirewallResult<()> {
		self.with_devices(|devices| match devices.remove(&map_key(address)) {
			Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
			Err(e) => Err(map_err(e)),
		})
		.await
	}

	#[instrument(skip(self))]
	async fn authorize(&self, address: IpAddr, session: SessionState) -> FirewallResult<()> {
		self.with_devices(|devices| {
			devices
				.insert(map_key(address), DeviceEntry::authorized(session), 0)
				.map_err(map_err)
		})
		.await?;
		info!(%address, "device authorized");
		Ok(())
	}

	#[instrument(skip(self))]
	async fn deauthenticate(&self, address: IpAddr) -> FirewallResult<()> {
		self.with_devices(|devices| {
			let key = map_key(address);
			devices.get(&key, 0).map_err(map_err)?;
			devices
				.insert(key, DeviceEntry::default(), 0)
				.map_err(map_err)
		})
		.await?;
		info!(%address, "device deauthenticated");
		Ok(())
	}

	async fn is_authorized(&self, address: IpAddr) -> FirewallResult<bool> {
		self.with_devices(|devices| match devices.get(&map_key(address), 0) {
			Ok(entry) => Ok(entry.authorized != 0),
			Err(MapError::KeyNotFound) => Ok(false),
			Err(e) => Err(map_err(e)),
		})
		.await
	}
}
