// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Baseline packet-filter and NAT rules for the tunnel interface.

use super::FirewallResult;
use crate::error::FirewallError;
use ipnet::IpNet;
use std::fmt;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
	pub table: &'static str,
	pub chain: &'static str,
	pub spec: Vec<String>,
}

impl Rule {
	fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
		Self {
			table,
			chain,
			spec: spec.iter().map(|s| s.to_string()).collect(),
		}
	}

	/// Arguments for `iptables` with the given operation flag (`-C`, `-A`,
	/// `-D`).
	pub fn args(&self, op: &str) -> Vec<String> {
		let mut args = vec![
			"-t".to_string(),
			self.table.to_string(),
			op.to_string(),
			self.chain.to_string(),
		];
		args.extend(self.spec.iter().cloned());
		args
	}
}

impl fmt::Display for Rule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
	}
}

/// The rule group that must exist while the gateway runs, in install order.
pub fn baseline_rules(dev: &str, range: IpNet, management_port: u16) -> Vec<Rule> {
	let range = range.trunc().to_string();
	let port = management_port.to_string();

	let echo_request: &[&str] = if range.contains(':') {
		&["-p", "ipv6-icmp", "--icmpv6-type", "128"]
	} else {
		&["-p", "icmp", "--icmp-type", "8"]
	};
	let mut icmp: Vec<&str> = echo_request.to_vec();
	icmp.extend(["-i", dev, "-m", "state", "--state", "NEW,ESTABLISHED,RELATED", "-j", "ACCEPT"]);

	vec![
		Rule::new(
			"filter",
			"FORWARD",
			&["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
		),
		Rule::new("filter", "FORWARD", &["-i", dev, "-j", "ACCEPT"]),
		Rule::new("nat", "POSTROUTING", &["-s", &range, "-j", "MASQUERADE"]),
		Rule::new(
			"filter",
			"INPUT",
			&["-m", "tcp", "-p", "tcp", "-i", dev, "--dport", &port, "-j", "ACCEPT"],
		),
		Rule::new("filter", "INPUT", &icmp),
		Rule::new("filter", "INPUT", &["-i", dev, "-j", "DROP"]),
	]
}

pub trait RuleBackend: Send + Sync {
	fn exists(&self, rule: &Rule) -> FirewallResult<bool>;

	fn append(&self, rule: &Rule) -> FirewallResult<()>;

	fn delete(&self, rule: &Rule) -> FirewallResult<()>;
}

/// Drives the `iptables` (or `ip6tables`) binary.
pub struct IptablesBackend {
	program: &'static str,
}

impl IptablesBackend {
	pub fn for_range(range: IpNet) -> Self {
		let program = match range {
			IpNet::V4(_) => "iptables",
			IpNet::V6(_) => "ip6tables",
		};
		Self { program }
	}

	fn run(&self, args: &[String]) -> FirewallResult<std::process::Output> {
		Command::new(self.program)
			.args(args)
			.output()
			.map_err(|source| FirewallError::Spawn {
				program: self.program.to_string(),
				source,
			})
	}

	fn checked(&self, rule: &Rule, op: &str) -> FirewallResult<()> {
		let args = rule.args(op);
		let output = self.run(&args)?;
		if !output.status.success() {
			return Err(FirewallError::Rule {
				command: format!("{} {}", self.program, args.join(" ")),
				message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(())
	}
}

impl RuleBackend for IptablesBackend {
	fn exists(&self, rule: &Rule) -> FirewallResult<bool> {
		let args = rule.args("-C");
		let output = self.run(&args)?;
		match output.status.code() {
			Some(0) => Ok(true),
			// iptables exits 1 for "no such rule", 2+ for usage or table errors.
			Some(1) => Ok(false),
			_ => Err(FirewallError::Rule {
				command: format!("{} {}", self.program, args.join(" ")),
				message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			}),
		}
	}

	fn append(&self, rule: &Rule) -> FirewallResult<()> {
		self.checked(rule, "-A")
	}

	fn delete(&self, rule: &Rule) -> FirewallResult<()> {
		self.checked(rule, "-D")
	}
}

/// The baseline rule group bound to a backend.
#[derive(Clone)]
pub struct FirewallBaseline {
	backend: Arc<dyn RuleBackend>,
	rules: Vec<Rule>,
}

impl FirewallBaseline {
	pub fn new(backend: Arc<dyn RuleBackend>, rules: Vec<Rule>) -> Self {
		Self { backend, rules }
	}

	pub fn rules(&self) -> &[Rule] {
		&self.rules
	}

	/// Appends every rule not already present. Stops at the first failure;
	/// whatever was installed stays for teardown to remove.
	#[instrument(skip(self), fields(rules = self.rules.len()))]
	pub fn install(&self) -> FirewallResult<()> {
		for rule in &self.rules {
			if self.backend.exists(rule)? {
				debug!(%rule, "rule already present");
				continue;
			}
			self.backend.append(rule)?;
			debug!(%rule, "installed rule");
		}
		info!("baseline firewall rules installed");
		Ok(())
	}

	/// Removes one rule. A rule that is already gone is not an error.
	pub fn remove(&self, rule: &Rule) -> FirewallResult<()> {
		if !self.backend.exists(rule)? {
			debug!(%rule, "rule already absent");
			return Ok(());
		}
		self.backend.delete(rule)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::FakeRules;

	fn rules() -> Vec<Rule> {
		baseline_rules("wg0", "10.0.0.0/24".parse().unwrap(), 8080)
	}

	#[test]
	fn renders_baseline_rules() {
		let rendered: Vec<String> = rules().iter().map(|r| r.args("-A").join(" ")).collect();
		assert_eq!(
			rendered,
			vec![
				"-t filter -A FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
				"-t filter -A FORWARD -i wg0 -j ACCEPT",
				"-t nat -A POSTROUTING -s 10.0.0.0/24 -j MASQUERADE",
				"-t filter -A INPUT -m tcp -p tcp -i wg0 --dport 8080 -j ACCEPT",
				"-t filter -A INPUT -p icmp --icmp-type 8 -i wg0 -m state --state NEW,ESTABLISHED,RELATED -j ACCEPT",
				"-t filter -A INPUT -i wg0 -j DROP",
			]
		);
	}

	#[test]
	fn masquerade_uses_network_address() {
		let rules = baseline_rules("wg0", "10.0.0.1/24".parse().unwrap(), 8080);
		assert_eq!(rules[2].spec[1], "10.0.0.0/24");
	}

	#[test]
	fn ipv6_range_uses_icmpv6() {
		let rules = baseline_rules("wg0", "fd00::/64".parse().unwrap(), 8080);
		assert!(rules[4].spec.contains(&"ipv6-icmp".to_string()));
		assert_eq!(
			IptablesBackend::for_range("fd00::/64".parse().unwrap()).program,
			"ip6tables"
		);
	}

	#[test]
	fn install_is_idempotent() {
		let fake = FakeRules::new(rules());
		let baseline = FirewallBaseline::new(Arc::new(fake.clone()), rules());

		baseline.install().unwrap();
		baseline.install().unwrap();

		assert_eq!(fake.installed(), rules());
		assert_eq!(fake.state.lock().unwrap().appends, 6);
	}

	#[test]
	fn install_stops_at_first_failure() {
		let fake = FakeRules::new(rules());
		fake.state.lock().unwrap().fail_append = Some(3);
		let baseline = FirewallBaseline::new(Arc::new(fake.clone()), rules());

		assert!(baseline.install().is_err());
		assert_eq!(fake.installed().len(), 3);
	}

	#[test]
	fn removing_absent_rule_is_tolerated() {
		let fake = FakeRules::new(rules());
		let baseline = FirewallBaseline::new(Arc::new(fake.clone()), rules());

		baseline.remove(&rules()[0]).unwrap();
		assert_eq!(fake.state.lock().unwrap().deletes, 0);
	}
}
