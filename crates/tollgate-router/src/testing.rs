// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory stand-ins for the kernel surfaces, shared by the unit tests.

use crate::driver::{DeviceSpec, DeviceState, DriverResult, PeerUpdate, TunnelDriver};
use crate::error::{DriverError, FirewallError};
use crate::firewall::rules::{Rule, RuleBackend};
use crate::firewall::{DeviceFirewall, FirewallResult, SessionState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate_wgtunnel_common::{PeerState, WgKeyPair, WgPublicKey};

pub fn key() -> WgPublicKey {
	*WgKeyPair::generate().public_key()
}

pub fn ip(s: &str) -> IpAddr {
	s.parse().unwrap()
}

pub fn sock(s: &str) -> SocketAddr {
	s.parse().unwrap()
}

#[derive(Debug, Default)]
pub struct DriverState {
	pub exists: bool,
	pub public_key: Option<WgPublicKey>,
	pub listen_port: u16,
	pub peers: Vec<PeerState>,
	pub applied: Vec<PeerUpdate>,
	pub reads: usize,
	pub fail_reads: bool,
	pub fail_applies: bool,
	pub fail_delete: bool,
	pub read_delay: Option<Duration>,
	pub created: usize,
	pub deleted: usize,
}

/// A device kept in memory. Clones share state so tests can poke at the
/// device the controller owns.
#[derive(Clone, Default)]
pub struct FakeDriver {
	pub state: Arc<Mutex<DriverState>>,
}

impl FakeDriver {
	pub fn running() -> Self {
		let driver = Self::default();
		{
			let mut state = driver.state.lock().unwrap();
			state.exists = true;
			state.public_key = Some(key());
			state.listen_port = 51820;
		}
		driver
	}

	pub fn with_peer(self, peer: PeerState) -> Self {
		self.state.lock().unwrap().peers.push(peer);
		self
	}

	pub fn set_endpoint(&self, public_key: &WgPublicKey, endpoint: SocketAddr) {
		let mut state = self.state.lock().unwrap();
		if let Some(peer) = state.peers.iter_mut().find(|p| &p.public_key == public_key) {
			peer.endpoint = Some(endpoint);
		}
	}

	pub fn peers(&self) -> Vec<PeerState> {
		self.state.lock().unwrap().peers.clone()
	}

	fn missing(&self) -> DriverError {
		DriverError::Unavailable {
			name: "wg-test".to_string(),
			source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
		}
	}
}

impl TunnelDriver for FakeDriver {
	fn name(&self) -> &str {
		"wg-test"
	}

	fn device(&self) -> DriverResult<DeviceState> {
		let delay = self.state.lock().unwrap().read_delay;
		if let Some(delay) = delay {
			std::thread::sleep(delay);
		}

		let mut state = self.state.lock().unwrap();
		state.reads += 1;
		if state.fail_reads || !state.exists {
			return Err(self.missing());
		}
		Ok(DeviceState {
			public_key: state.public_key.unwrap_or_else(key),
			listen_port: state.listen_port,
			peers: state.peers.clone(),
		})
	}

	fn apply(&self, update: PeerUpdate) -> DriverResult<()> {
		let mut state = self.state.lock().unwrap();
		if state.fail_applies || !state.exists {
			return Err(DriverError::Apply {
				name: "wg-test".to_string(),
				source: io::Error::other("apply refused"),
			});
		}

		match &update {
			PeerUpdate::Upsert {
				public_key,
				address,
			} => {
				let replaced = PeerState::new(*public_key).with_address(*address);
				match state.peers.iter_mut().find(|p| &p.public_key == public_key) {
					Some(existing) => existing.allowed_ips = replaced.allowed_ips,
					None => state.peers.push(replaced),
				}
			}
			PeerUpdate::Remove { public_key } => {
				state.peers.retain(|p| &p.public_key != public_key);
			}
		}
		state.applied.push(update);
		Ok(())
	}

	fn create_device(&self, spec: &DeviceSpec) -> DriverResult<()> {
		let mut state = self.state.lock().unwrap();
		state.exists = true;
		state.public_key = Some(spec.private_key.public_key());
		state.listen_port = spec.listen_port;
		state.created += 1;
		Ok(())
	}

	fn delete_device(&self) -> DriverResult<()> {
		let mut state = self.state.lock().unwrap();
		if state.fail_delete {
			return Err(DriverError::Apply {
				name: "wg-test".to_string(),
				source: io::Error::other("delete refused"),
			});
		}
		if !state.exists {
			return Ok(());
		}
		state.exists = false;
		state.peers.clear();
		state.deleted += 1;
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct FirewallState {
	pub loaded: bool,
	pub devices: HashMap<IpAddr, Option<SessionState>>,
	pub deauthenticated: Vec<IpAddr>,
	pub fail_deauth: HashSet<IpAddr>,
	pub fail_load: bool,
	pub fail_unload: bool,
	pub unloads: usize,
	pub pinned: bool,
	pub unpins: usize,
}

#[derive(Clone, Default)]
pub struct FakeFirewall {
	pub state: Arc<Mutex<FirewallState>>,
}

impl FakeFirewall {
	pub fn deauthenticated(&self) -> Vec<IpAddr> {
		self.state.lock().unwrap().deauthenticated.clone()
	}
}

#[async_trait]
impl DeviceFirewall for FakeFirewall {
	async fn load(&self) -> FirewallResult<()> {
		let mut state = self.state.lock().unwrap();
		if state.fail_load {
			return Err(FirewallError::Xdp("program rejected".to_string()));
		}
		state.loaded = true;
		Ok(())
	}

	async fn unload(&self) -> FirewallResult<()> {
		let mut state = self.state.lock().unwrap();
		state.unloads += 1;
		if state.fail_unload {
			return Err(FirewallError::Xdp("detach failed".to_string()));
		}
		state.loaded = false;
		Ok(())
	}

	async fn pin(&self) -> FirewallResult<()> {
		let mut state = self.state.lock().unwrap();
		if !state.loaded {
			return Err(FirewallError::NotLoaded);
		}
		state.pinned = true;
		Ok(())
	}

	async fn unpin(&self) -> FirewallResult<()> {
		let mut state = self.state.lock().unwrap();
		state.unpins += 1;
		state.pinned = false;
		Ok(())
	}

	async fn add_device(&self, address: IpAddr) -> FirewallResult<()> {
		self.state.lock().unwrap().devices.insert(address, None);
		Ok(())
	}

	async fn remove_device(&self, address: IpAddr) -> FirewallResult<()> {
		self.state.lock().unwrap().devices.remove(&address);
		Ok(())
	}

	async fn authorize(&self, address: IpAddr, session: SessionState) -> FirewallResult<()> {
		self.state.lock().unwrap().devices.insert(address, Some(session));
		Ok(())
	}

	async fn deauthenticate(&self, address: IpAddr) -> FirewallResult<()> {
		let mut state = self.state.lock().unwrap();
		state.deauthenticated.push(address);
		if state.fail_deauth.contains(&address) {
			return Err(FirewallError::Xdp(format!("no map entry for {address}")));
		}
		if let Some(entry) = state.devices.get_mut(&address) {
			*entry = None;
		}
		Ok(())
	}

	async fn is_authorized(&self, address: IpAddr) -> FirewallResult<bool> {
		Ok(matches!(
			self.state.lock().unwrap().devices.get(&address),
			Some(Some(_))
		))
	}
}

#[derive(Debug, Default)]
pub struct RuleState {
	pub installed: Vec<Rule>,
	pub fail_append: Option<usize>,
	pub fail_delete: HashSet<usize>,
	pub appends: usize,
	pub deletes: usize,
}

/// Rule table in memory. Failures are injected by rule position in the
/// baseline list.
#[derive(Clone, Default)]
pub struct FakeRules {
	pub state: Arc<Mutex<RuleState>>,
	pub baseline: Vec<Rule>,
}

impl FakeRules {
	pub fn new(baseline: Vec<Rule>) -> Self {
		Self {
			state: Arc::default(),
			baseline,
		}
	}

	pub fn installed(&self) -> Vec<Rule> {
		self.state.lock().unwrap().installed.clone()
	}

	fn position(&self, rule: &Rule) -> Option<usize> {
		self.baseline.iter().position(|r| r == rule)
	}

	fn refused(rule: &Rule) -> FirewallError {
		FirewallError::Rule {
			command: rule.to_string(),
			message: "refused".to_string(),
		}
	}
}

impl RuleBackend for FakeRules {
	fn exists(&self, rule: &Rule) -> FirewallResult<bool> {
		Ok(self.state.lock().unwrap().installed.contains(rule))
	}

	fn append(&self, rule: &Rule) -> FirewallResult<()> {
		let position = self.position(rule);
		let mut state = self.state.lock().unwrap();
		if position.is_some() && state.fail_append == position {
			return Err(Self::refused(rule));
		}
		state.appends += 1;
		state.installed.push(rule.clone());
		Ok(())
	}

	fn delete(&self, rule: &Rule) -> FirewallResult<()> {
		let position = self.position(rule);
		let mut state = self.state.lock().unwrap();
		if position.is_some_and(|p| state.fail_delete.contains(&p)) {
			return Err(Self::refused(rule));
		}
		state.deletes += 1;
		state.installed.retain(|r| r != rule);
		Ok(())
	}
}
