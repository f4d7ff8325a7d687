// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// A peer that violates the one-allowed-IP-per-peer rule. Such peers are
/// never matched by address and never considered for endpoint enforcement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("peer {public_key} has {allowed_ips} allowed IPs, exactly one is supported")]
pub struct MalformedPeer {
	pub public_key: WgPublicKey,
	pub allowed_ips: usize,
}

/// A peer as the tunnel driver reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub endpoint: Option<SocketAddr>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
}

impl PeerState {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			endpoint: None,
			allowed_ips: Vec::new(),
		}
	}

	pub fn with_address(mut self, address: IpAddr) -> Self {
		self.allowed_ips.push(IpNet::from(address));
		self
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	/// The tunnel address bound to this peer.
	pub fn single_address(&self) -> Result<IpAddr, MalformedPeer> {
		match self.allowed_ips.as_slice() {
			[only] => Ok(only.addr()),
			other => Err(MalformedPeer {
				public_key: self.public_key,
				allowed_ips: other.len(),
			}),
		}
	}
}
