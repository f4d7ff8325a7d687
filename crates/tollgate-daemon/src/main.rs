// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! tollgate: WireGuard access gateway daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tollgate_router::{Gateway, GatewayConfig, RouterError};
use tollgate_server_db::{create_pool, AdminRepository, RegistrationRepository, SqlitePool};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
	Pretty,
	Json,
}

/// tollgate - WireGuard access gateway with per-device firewall admission.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version)]
struct Args {
	/// Path to the TOML configuration file
	#[arg(long, short, env = "TOLLGATE_CONFIG")]
	config: Option<PathBuf>,

	/// Do not install the baseline iptables rules
	#[arg(long, env = "TOLLGATE_NO_IPTABLES")]
	no_iptables: bool,

	/// Leave the XDP device map pinned on shutdown so a restart keeps
	/// existing authorizations
	#[arg(long, env = "TOLLGATE_KEEP_PINS")]
	keep_pins: bool,

	#[arg(long, value_enum, default_value = "pretty", env = "TOLLGATE_LOG_FORMAT")]
	log_format: LogFormat,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the gateway (default)
	Run,
	/// Create an admin account
	AddAdmin {
		username: String,
		/// Password for the new account
		#[arg(long, env = "TOLLGATE_ADMIN_PASSWORD", hide_env_values = true)]
		password: String,
	},
	/// Issue a registration token for a user
	IssueToken {
		username: String,
		/// Address of an enrolled device the token re-enrols
		#[arg(long)]
		overwrite: Option<String>,
		#[arg(long = "group")]
		groups: Vec<String>,
	},
}

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
		LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_tracing(args.log_format);

	let config = GatewayConfig::load(args.config.as_deref()).context("invalid configuration")?;

	match args.command.unwrap_or(Command::Run) {
		Command::Run => run(config, !args.no_iptables, args.keep_pins).await,
		Command::AddAdmin { username, password } => {
			let pool = open_database(&config).await?;
			AdminRepository::new(pool).create(&username, &password).await?;
			println!("created admin {username}");
			Ok(())
		}
		Command::IssueToken {
			username,
			overwrite,
			groups,
		} => {
			let pool = open_database(&config).await?;
			let token = RegistrationRepository::new(pool)
				.generate(&username, overwrite.as_deref(), &groups)
				.await?;
			println!("{token}");
			Ok(())
		}
	}
}

async fn open_database(config: &GatewayConfig) -> Result<SqlitePool> {
	create_pool(&config.database_url)
		.await
		.with_context(|| format!("failed to open database {}", config.database_url))
}

async fn run(config: GatewayConfig, enable_rules: bool, keep_pins: bool) -> Result<()> {
	info!(
		device = %config.wireguard.dev_name,
		range = %config.wireguard.range,
		external = config.wireguard.external,
		"starting tollgate"
	);

	let gateway = Gateway::from_config(config)?;
	let (fatal_tx, fatal_rx) = mpsc::channel::<RouterError>(1);
	gateway.setup(enable_rules, fatal_tx).await?;

	if keep_pins {
		if let Err(e) = gateway.pin_bpf().await {
			warn!(error = %e, "cannot pin XDP maps, they will be removed on shutdown");
		}
	}

	gateway
		.serve(fatal_rx, async {
			let signal = shutdown_signal().await;
			info!(signal, "received shutdown signal");
		})
		.await
		.map_err(anyhow::Error::from)
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
	use tokio::signal::unix::{signal, SignalKind};

	match signal(SignalKind::terminate()) {
		Ok(mut term) => tokio::select! {
			_ = tokio::signal::ctrl_c() => "SIGINT",
			_ = term.recv() => "SIGTERM",
		},
		Err(e) => {
			warn!(error = %e, "cannot listen for SIGTERM");
			let _ = tokio::signal::ctrl_c().await;
			"SIGINT"
		}
	}
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
	let _ = tokio::signal::ctrl_c().await;
	"ctrl-c"
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn cli_is_well_formed() {
		Args::command().debug_assert();
	}

	#[test]
	fn defaults_to_running_with_rules() {
		let args = Args::try_parse_from(["tollgate"]).unwrap();
		assert!(args.command.is_none());
		assert!(!args.no_iptables);
		assert!(!args.keep_pins);
		assert_eq!(args.log_format, LogFormat::Pretty);
	}

	#[test]
	fn parses_flags_and_subcommands() {
		let args = Args::try_parse_from([
			"tollgate",
			"--config",
			"/etc/tollgate.toml",
			"--no-iptables",
			"--keep-pins",
			"--log-format",
			"json",
			"issue-token",
			"alice",
			"--overwrite",
			"10.0.0.2",
			"--group",
			"ops",
			"--group",
			"dev",
		])
		.unwrap();

		assert_eq!(args.config, Some(PathBuf::from("/etc/tollgate.toml")));
		assert!(args.no_iptables);
		assert!(args.keep_pins);
		assert_eq!(args.log_format, LogFormat::Json);
		match args.command {
			Some(Command::IssueToken {
				username,
				overwrite,
				groups,
			}) => {
				assert_eq!(username, "alice");
				assert_eq!(overwrite.as_deref(), Some("10.0.0.2"));
				assert_eq!(groups, vec!["ops", "dev"]);
			}
			other => panic!("unexpected command {other:?}"),
		}
	}
}
