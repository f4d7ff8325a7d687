// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Single owner of the tunnel driver.
//!
//! Reads share the driver; anything that changes the device takes the write
//! half, so allocation sees the peer list it is about to extend.

use crate::driver::{DeviceSpec, PeerUpdate, TunnelDriver};
use crate::error::{Result, RouterError};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tollgate_wgtunnel_common::{AddressAllocator, PeerState, WgPublicKey};
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct TunnelController {
	driver: Arc<RwLock<Box<dyn TunnelDriver>>>,
	allocator: AddressAllocator,
	device_name: Arc<str>,
}

impl TunnelController {
	pub fn new(driver: Box<dyn TunnelDriver>, allocator: AddressAllocator) -> Self {
		let device_name = Arc::from(driver.name());
		Self {
			driver: Arc::new(RwLock::new(driver)),
			allocator,
			device_name,
		}
	}

	pub fn device_name(&self) -> &str {
		&self.device_name
	}

	pub fn allocator(&self) -> &AddressAllocator {
		&self.allocator
	}

	async fn read<T, F>(&self, f: F) -> Result<T>
	where
		F: FnOnce(&dyn TunnelDriver) -> Result<T> + Send + 'static,
		T: Send + 'static,
	{
		let guard = Arc::clone(&self.driver).read_owned().await;
		tokio::task::spawn_blocking(move || f(&**guard)).await?
	}

	async fn write<T, F>(&self, f: F) -> Result<T>
	where
		F: FnOnce(&dyn TunnelDriver) -> Result<T> + Send + 'static,
		T: Send + 'static,
	{
		let guard = Arc::clone(&self.driver).write_owned().await;
		tokio::task::spawn_blocking(move || f(&**guard)).await?
	}

	/// The device's public key and listen port.
	#[instrument(skip(self), fields(device = %self.device_name))]
	pub async fn server_identity(&self) -> Result<(WgPublicKey, u16)> {
		self.read(|driver| {
			let device = driver.device()?;
			Ok((device.public_key, device.listen_port))
		})
		.await
	}

	/// Allocates the next tunnel address and binds it to `public_key`.
	#[instrument(skip(self), fields(device = %self.device_name, %public_key))]
	pub async fn add_peer(&self, public_key: WgPublicKey) -> Result<IpAddr> {
		let allocator = self.allocator;
		let address = self
			.write(move |driver| {
				let device = driver.device()?;
				let existing = bound_addresses(&device.peers);
				let address = allocator.next_address(&existing)?;
				driver.apply(PeerUpdate::Upsert {
					public_key,
					address,
				})?;
				Ok(address)
			})
			.await?;

		info!(%address, "added peer");
		Ok(address)
	}

	/// Removes `public_key` from the device and returns the address it was
	/// bound to, if the device knew the peer.
	#[instrument(skip(self), fields(device = %self.device_name, %public_key))]
	pub async fn remove_peer(&self, public_key: WgPublicKey) -> Result<Option<IpAddr>> {
		let bound = self
			.write(move |driver| {
				let device = driver.device()?;
				let bound = device
					.peers
					.iter()
					.find(|p| p.public_key == public_key)
					.and_then(|p| p.single_address().ok());
				driver.apply(PeerUpdate::Remove { public_key })?;
				Ok(bound)
			})
			.await?;

		match bound {
			Some(address) => info!(%address, "removed peer"),
			None => debug!("removed peer with no bound address"),
		}
		Ok(bound)
	}

	/// The external endpoint of the peer bound to `address`. `Ok(None)` means
	/// the peer exists but has not completed a handshake yet.
	#[instrument(skip(self), fields(device = %self.device_name))]
	pub async fn get_real_address(&self, address: IpAddr) -> Result<Option<SocketAddr>> {
		self.read(move |driver| {
			let device = driver.device()?;
			for peer in &device.peers {
				match peer.single_address() {
					Ok(bound) if bound == address => return Ok(peer.endpoint),
					Ok(_) => {}
					Err(e) => warn!(error = %e, "skipping malformed peer"),
				}
			}
			Err(RouterError::NotFound(address))
		})
		.await
	}

	/// All peers in driver order.
	pub async fn peer_endpoints(&self) -> Result<Vec<PeerState>> {
		self.read(|driver| Ok(driver.device()?.peers)).await
	}

	#[instrument(skip(self, spec), fields(device = %self.device_name, address = %spec.address))]
	pub async fn bring_up(&self, spec: DeviceSpec) -> Result<()> {
		self.write(move |driver| Ok(driver.create_device(&spec)?))
			.await
	}

	#[instrument(skip(self), fields(device = %self.device_name))]
	pub async fn delete_device(&self) -> Result<()> {
		self.write(|driver| Ok(driver.delete_device()?)).await
	}
}

/// Addresses of well-formed peers, in driver order. Malformed peers cannot
/// anchor allocation.
fn bound_addresses(peers: &[PeerState]) -> Vec<IpAddr> {
	peers
		.iter()
		.filter_map(|peer| match peer.single_address() {
			Ok(address) => Some(address),
			Err(e) => {
				warn!(error = %e, "skipping malformed peer during allocation");
				None
			}
		})
		.collect()
}
