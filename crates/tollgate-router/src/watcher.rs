// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Endpoint roaming enforcement.
//!
//! A peer's external endpoint is part of its authenticated identity. When the
//! driver reports a different endpoint for a key we have already seen, the
//! device bound to that key is sent back through authentication.

use crate::controller::TunnelController;
use crate::error::Result;
use crate::firewall::DeviceFirewall;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tollgate_wgtunnel_common::{PeerState, WgPublicKey};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointChange {
	pub public_key: WgPublicKey,
	pub address: IpAddr,
	pub old: SocketAddr,
	pub new: SocketAddr,
}

pub struct EndpointWatcher {
	controller: TunnelController,
	firewall: Arc<dyn DeviceFirewall>,
	interval: Duration,
	endpoints: HashMap<WgPublicKey, SocketAddr>,
	malformed: HashSet<WgPublicKey>,
}

impl EndpointWatcher {
	pub fn new(
		controller: TunnelController,
		firewall: Arc<dyn DeviceFirewall>,
		interval: Duration,
	) -> Self {
		Self {
			controller,
			firewall,
			interval,
			endpoints: HashMap::new(),
			malformed: HashSet::new(),
		}
	}

	/// Folds one poll into the endpoint map and returns the peers whose
	/// endpoint moved since the previous poll.
	pub fn observe(&mut self, peers: &[PeerState]) -> Vec<EndpointChange> {
		let mut changes = Vec::new();
		let mut present = HashSet::with_capacity(peers.len());

		for peer in peers {
			present.insert(peer.public_key);

			let address = match peer.single_address() {
				Ok(address) => {
					if self.malformed.remove(&peer.public_key) {
						debug!(public_key = %peer.public_key, "peer is well-formed again");
					}
					address
				}
				Err(e) => {
					if self.malformed.insert(peer.public_key) {
						warn!(error = %e, "ignoring malformed peer");
					}
					continue;
				}
			};

			// A peer that has never reported an endpoint stays unseen. One that
			// loses its endpoint keeps its last record, so coming back from
			// somewhere else is still a change.
			let Some(current) = peer.endpoint else {
				continue;
			};

			match self.endpoints.insert(peer.public_key, current) {
				None => {
					debug!(public_key = %peer.public_key, %address, endpoint = %current, "first endpoint observed");
				}
				Some(previous) if previous != current => changes.push(EndpointChange {
					public_key: peer.public_key,
					address,
					old: previous,
					new: current,
				}),
				Some(_) => {}
			}
		}

		self.endpoints.retain(|key, _| present.contains(key));
		self.malformed.retain(|key| present.contains(key));
		changes
	}

	/// One poll: read the driver, diff, de-authorize every moved device.
	pub async fn tick(&mut self) -> Result<Vec<EndpointChange>> {
		let peers = self.controller.peer_endpoints().await?;
		let changes = self.observe(&peers);

		for change in &changes {
			info!(
				public_key = %change.public_key,
				address = %change.address,
				old = %change.old,
				new = %change.new,
				"peer endpoint changed, forcing re-authentication"
			);
			if let Err(e) = self.firewall.deauthenticate(change.address).await {
				error!(
					error = %e,
					public_key = %change.public_key,
					address = %change.address,
					"failed to deauthenticate roaming device"
				);
			}
		}

		Ok(changes)
	}

	/// Polls until `shutdown` flips to true. A driver failure ends the loop
	/// with the error.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		info!(interval_ms = self.interval.as_millis() as u64, "endpoint watcher started");

		loop {
			if *shutdown.borrow() {
				break;
			}

			if let Err(e) = self.tick().await {
				error!(error = %e, "endpoint watcher cannot read tunnel device");
				return Err(e);
			}

			tokio::select! {
				biased;

				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}

				_ = tokio::time::sleep(self.interval) => {}
			}
		}

		info!("endpoint watcher stopped");
		Ok(())
	}
}
