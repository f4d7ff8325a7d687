// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer lifecycle and firewall synchronization for the tollgate WireGuard
//! gateway.
//!
//! The [`Gateway`] owns a [`TunnelController`] (the only holder of the tunnel
//! driver), the baseline iptables rules, the XDP admission program and the
//! [`EndpointWatcher`] that forces re-authentication when a peer roams.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod kernel;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, GatewayConfig, GatewayConfigLayer};
pub use controller::TunnelController;
pub use driver::{DeviceSpec, DeviceState, PeerUpdate, TunnelDriver};
pub use error::{DriverError, FirewallError, Result, RouterError};
pub use firewall::{DeviceFirewall, SessionState};
pub use gateway::{Gateway, TeardownReport, TeardownStep};
pub use kernel::KernelDriver;
pub use watcher::{EndpointChange, EndpointWatcher};
