// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Gateway lifecycle: bring the tunnel, rules and XDP program up in order,
//! and take them down again exactly once.

use crate::config::GatewayConfig;
use crate::controller::TunnelController;
use crate::driver::{DeviceSpec, TunnelDriver};
use crate::error::{Result, RouterError};
use crate::firewall::{
	baseline_rules, DeviceFirewall, FirewallBaseline, IptablesBackend, Rule, RuleBackend,
	SessionState, XdpFirewall,
};
use crate::kernel::KernelDriver;
use crate::watcher::EndpointWatcher;
use ipnet::IpNet;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tollgate_wgtunnel_common::{AddressAllocator, WgPrivateKey, WgPublicKey};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
	RemoveRule(Rule),
	DeleteDevice(String),
	UnloadXdp,
	UnpinXdp,
}

impl fmt::Display for TeardownStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::RemoveRule(rule) => write!(f, "remove rule {rule}"),
			Self::DeleteDevice(name) => write!(f, "delete device {name}"),
			Self::UnloadXdp => f.write_str("unload XDP program"),
			Self::UnpinXdp => f.write_str("unpin XDP maps"),
		}
	}
}

#[derive(Debug, Default)]
pub struct TeardownReport {
	pub completed: Vec<TeardownStep>,
	pub failed: Vec<(TeardownStep, String)>,
	/// Set when an earlier call already tore the gateway down.
	pub skipped: bool,
}

impl TeardownReport {
	pub fn is_clean(&self) -> bool {
		self.failed.is_empty()
	}

	fn record(&mut self, step: TeardownStep, outcome: std::result::Result<(), String>) {
		match outcome {
			Ok(()) => self.completed.push(step),
			Err(message) => {
				error!(%step, error = %message, "teardown step failed");
				self.failed.push((step, message));
			}
		}
	}
}

pub struct Gateway {
	config: GatewayConfig,
	controller: TunnelController,
	firewall: Arc<dyn DeviceFirewall>,
	baseline: FirewallBaseline,
	rules_enabled: AtomicBool,
	pinned: AtomicBool,
	torn_down: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
	watcher: Mutex<Option<JoinHandle<()>>>,
	/// Held across every peer change so the driver and the XDP map move
	/// together.
	provision: Mutex<()>,
}

impl Gateway {
	pub fn new(
		config: GatewayConfig,
		driver: Box<dyn TunnelDriver>,
		firewall: Arc<dyn DeviceFirewall>,
		rules: Arc<dyn RuleBackend>,
	) -> Self {
		let wg = &config.wireguard;
		let controller = TunnelController::new(
			driver,
			AddressAllocator::new(wg.range, wg.server_address),
		);
		let baseline = FirewallBaseline::new(
			rules,
			baseline_rules(&wg.dev_name, wg.range, config.tunnel_listen_address.port()),
		);
		let (shutdown_tx, _) = watch::channel(false);

		Self {
			config,
			controller,
			firewall,
			baseline,
			rules_enabled: AtomicBool::new(false),
			pinned: AtomicBool::new(false),
			torn_down: AtomicBool::new(false),
			shutdown_tx,
			watcher: Mutex::new(None),
			provision: Mutex::new(()),
		}
	}

	/// Wires the gateway to the kernel: WireGuard over netlink, iptables and
	/// the XDP program from the configured object file.
	pub fn from_config(config: GatewayConfig) -> Result<Self> {
		let driver = KernelDriver::new(&config.wireguard.dev_name)?;
		let firewall = XdpFirewall::new(config.xdp.clone(), &config.wireguard.dev_name);
		let rules = IptablesBackend::for_range(config.wireguard.range);
		Ok(Self::new(
			config,
			Box::new(driver),
			Arc::new(firewall),
			Arc::new(rules),
		))
	}

	pub fn controller(&self) -> &TunnelController {
		&self.controller
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.config
	}

	/// Brings the gateway up. On failure everything already done is torn
	/// down before the error is returned. A driver failure in the endpoint
	/// watcher is sent on `fatal` once the gateway is running.
	#[instrument(skip(self, fatal), fields(device = %self.config.wireguard.dev_name))]
	pub async fn setup(&self, enable_rules: bool, fatal: mpsc::Sender<RouterError>) -> Result<()> {
		match self.bring_up(enable_rules, fatal).await {
			Ok(()) => {
				info!("gateway running");
				Ok(())
			}
			Err(e) => {
				error!(error = %e, "gateway setup failed, tearing down");
				self.teardown().await;
				Err(e)
			}
		}
	}

	async fn bring_up(&self, enable_rules: bool, fatal: mpsc::Sender<RouterError>) -> Result<()> {
		let wg = &self.config.wireguard;

		if wg.external {
			let (public_key, listen_port) = self.controller.server_identity().await?;
			info!(%public_key, listen_port, "attached to externally managed device");
		} else {
			let private_key = self.private_key().await?;
			// The gateway keeps its own address with the tunnel prefix.
			let address = IpNet::new(wg.server_address, wg.range.prefix_len())
				.map_err(|e| crate::config::ConfigError::Validation(e.to_string()))?;
			self.controller
				.bring_up(DeviceSpec {
					private_key,
					listen_port: wg.listen_port,
					address,
				})
				.await?;
		}

		if enable_rules {
			self.rules_enabled.store(true, Ordering::SeqCst);
			let baseline = self.baseline.clone();
			tokio::task::spawn_blocking(move || baseline.install()).await??;
		} else {
			warn!("baseline firewall rules disabled");
		}

		self.firewall.load().await?;

		// Peers that survive a restart of an external device still need
		// their unauthorized entries.
		for peer in self.controller.peer_endpoints().await? {
			if let Ok(address) = peer.single_address() {
				self.firewall.add_device(address).await?;
			}
		}

		let watcher = EndpointWatcher::new(
			self.controller.clone(),
			Arc::clone(&self.firewall),
			self.config.poll_interval,
		);
		let shutdown_rx = self.shutdown_tx.subscribe();
		let handle = tokio::spawn(async move {
			if let Err(e) = watcher.run(shutdown_rx).await {
				if fatal.send(e).await.is_err() {
					error!("fatal error channel closed");
				}
			}
		});
		*self.watcher.lock().await = Some(handle);

		Ok(())
	}

	async fn private_key(&self) -> Result<WgPrivateKey> {
		match &self.config.wireguard.private_key_path {
			Some(path) => {
				let encoded = tokio::fs::read_to_string(path)
					.await
					.map_err(|source| RouterError::PrivateKey {
						path: path.clone(),
						source,
					})?;
				Ok(WgPrivateKey::from_base64(&encoded)?)
			}
			None => {
				warn!("no private key configured, generating an ephemeral one");
				Ok(WgPrivateKey::generate())
			}
		}
	}

	/// Runs until `shutdown` resolves or the watcher reports a fatal error,
	/// then tears down. Teardown happens on every path out.
	pub async fn serve<F>(&self, mut fatal: mpsc::Receiver<RouterError>, shutdown: F) -> Result<()>
	where
		F: Future<Output = ()>,
	{
		match self.server_identity().await {
			Ok((public_key, listen_port)) => info!(%public_key, listen_port, "gateway ready"),
			Err(e) => warn!(error = %e, "cannot read gateway identity"),
		}

		let outcome = tokio::select! {
			biased;

			() = shutdown => {
				info!("shutting down");
				Ok(())
			}
			Some(e) = fatal.recv() => {
				error!(error = %e, "fatal gateway error, shutting down");
				Err(e)
			}
		};

		let report = self.teardown().await;
		for (step, message) in &report.failed {
			warn!(%step, error = %message, "resource left behind");
		}
		outcome
	}

	/// Stops the watcher and undoes setup. Every step runs regardless of
	/// the others; only the first call does anything.
	#[instrument(skip(self), fields(device = %self.config.wireguard.dev_name))]
	pub async fn teardown(&self) -> TeardownReport {
		let mut report = TeardownReport::default();
		if self.torn_down.swap(true, Ordering::SeqCst) {
			report.skipped = true;
			return report;
		}

		self.shutdown_tx.send_replace(true);
		if let Some(handle) = self.watcher.lock().await.take() {
			if let Err(e) = handle.await {
				warn!(error = %e, "endpoint watcher task did not exit cleanly");
			}
		}

		if self.rules_enabled.load(Ordering::SeqCst) {
			for rule in self.baseline.rules() {
				let baseline = self.baseline.clone();
				let target = rule.clone();
				let outcome = tokio::task::spawn_blocking(move || baseline.remove(&target))
					.await
					.map_err(|e| e.to_string())
					.and_then(|r| r.map_err(|e| e.to_string()));
				report.record(TeardownStep::RemoveRule(rule.clone()), outcome);
			}
		}

		if !self.config.wireguard.external {
			let outcome = self.controller.delete_device().await.map_err(|e| e.to_string());
			report.record(
				TeardownStep::DeleteDevice(self.config.wireguard.dev_name.clone()),
				outcome,
			);
		}

		let outcome = self.firewall.unload().await.map_err(|e| e.to_string());
		report.record(TeardownStep::UnloadXdp, outcome);

		if !self.pinned.load(Ordering::SeqCst) {
			let outcome = self.firewall.unpin().await.map_err(|e| e.to_string());
			report.record(TeardownStep::UnpinXdp, outcome);
		}

		info!(
			completed = report.completed.len(),
			failed = report.failed.len(),
			"gateway torn down"
		);
		report
	}

	/// Provisions a peer for `public_key` and gives its address an
	/// unauthorized firewall entry. A key that already has a peer is
	/// re-provisioned from scratch.
	#[instrument(skip(self), fields(%public_key))]
	pub async fn add_peer(&self, public_key: WgPublicKey) -> Result<IpAddr> {
		let _provision = self.provision.lock().await;
		if let Some(previous) = self.controller.remove_peer(public_key).await? {
			self.firewall.remove_device(previous).await?;
		}

		let address = self.controller.add_peer(public_key).await?;
		if let Err(e) = self.firewall.add_device(address).await {
			warn!(error = %e, %address, "rolling back peer after firewall failure");
			if let Err(rollback) = self.controller.remove_peer(public_key).await {
				error!(error = %rollback, %address, "failed to roll back peer");
			}
			return Err(e.into());
		}
		Ok(address)
	}

	#[instrument(skip(self), fields(%public_key))]
	pub async fn remove_peer(&self, public_key: WgPublicKey) -> Result<Option<IpAddr>> {
		let _provision = self.provision.lock().await;
		let bound = self.controller.remove_peer(public_key).await?;
		if let Some(address) = bound {
			self.firewall.remove_device(address).await?;
		}
		Ok(bound)
	}

	/// Keeps the device map pinned past teardown, so a restarted gateway
	/// finds its authorizations.
	pub async fn pin_bpf(&self) -> Result<()> {
		self.firewall.pin().await?;
		self.pinned.store(true, Ordering::SeqCst);
		Ok(())
	}

	pub async fn unpin_bpf(&self) -> Result<()> {
		self.firewall.unpin().await?;
		self.pinned.store(false, Ordering::SeqCst);
		Ok(())
	}

	pub async fn server_identity(&self) -> Result<(WgPublicKey, u16)> {
		self.controller.server_identity().await
	}

	pub async fn get_real_address(&self, address: IpAddr) -> Result<Option<SocketAddr>> {
		self.controller.get_real_address(address).await
	}

	pub async fn authorize(&self, address: IpAddr, session: SessionState) -> Result<()> {
		Ok(self.firewall.authorize(address, session).await?)
	}

	pub async fn deauthenticate(&self, address: IpAddr) -> Result<()> {
		Ok(self.firewall.deauthenticate(address).await?)
	}

	pub async fn is_authorized(&self, address: IpAddr) -> Result<bool> {
		Ok(self.firewall.is_authorized(address).await?)
	}
}
