// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Gateway configuration.
//!
//! Values are read in layers: built-in defaults, then an optional TOML file,
//! then `TOLLGATE_*` environment variables. The merged layer is validated
//! into a [`GatewayConfig`] before anything touches the host.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "TOLLGATE_";

const DEFAULT_DEV_NAME: &str = "wg0";
const DEFAULT_LISTEN_PORT: u16 = 51820;
const DEFAULT_TUNNEL_LISTEN_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_XDP_OBJECT_PATH: &str = "/usr/lib/tollgate/xdp.o";
const DEFAULT_XDP_PIN_PATH: &str = "/sys/fs/bpf/tollgate";
const DEFAULT_DATABASE_URL: &str = "sqlite:/var/lib/tollgate/tollgate.db";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

// Linux IFNAMSIZ minus the trailing NUL.
const MAX_DEV_NAME_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("missing required value: {0}")]
	MissingValue(String),

	#[error("failed to parse TOML config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("validation error: {0}")]
	Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WireguardLayer {
	pub dev_name: Option<String>,
	pub range: Option<String>,
	pub server_address: Option<String>,
	pub external: Option<bool>,
	pub listen_port: Option<u16>,
	pub private_key_path: Option<PathBuf>,
}

impl WireguardLayer {
	pub fn merge(&mut self, other: Self) {
		if other.dev_name.is_some() {
			self.dev_name = other.dev_name;
		}
		if other.range.is_some() {
			self.range = other.range;
		}
		if other.server_address.is_some() {
			self.server_address = other.server_address;
		}
		if other.external.is_some() {
			self.external = other.external;
		}
		if other.listen_port.is_some() {
			self.listen_port = other.listen_port;
		}
		if other.private_key_path.is_some() {
			self.private_key_path = other.private_key_path;
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebserverLayer {
	pub tunnel_listen_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct XdpLayer {
	pub object_path: Option<PathBuf>,
	pub pin_path: Option<PathBuf>,
	/// Hex SHA-256 of the object file. Unset skips the check.
	pub object_sha256: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseLayer {
	pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatcherLayer {
	pub poll_interval_ms: Option<u64>,
}

/// Partially specified configuration, as read from one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfigLayer {
	#[serde(default)]
	pub wireguard: WireguardLayer,
	#[serde(default)]
	pub webserver: WebserverLayer,
	#[serde(default)]
	pub xdp: XdpLayer,
	#[serde(default)]
	pub database: DatabaseLayer,
	#[serde(default)]
	pub watcher: WatcherLayer,
}

impl GatewayConfigLayer {
	pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
		toml::from_str(content).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&content, path)
	}

	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_env_with(|name| std::env::var(name).ok())
	}

	/// Builds a layer from `TOLLGATE_*` variables resolved through `lookup`.
	pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |suffix: &str| {
			lookup(&format!("{ENV_PREFIX}{suffix}"))
				.map(|v| v.trim().to_string())
				.filter(|v| !v.is_empty())
		};

		Ok(Self {
			wireguard: WireguardLayer {
				dev_name: var("WG_DEV_NAME"),
				range: var("WG_RANGE"),
				server_address: var("WG_SERVER_ADDRESS"),
				external: parse_bool("WG_EXTERNAL", var("WG_EXTERNAL"))?,
				listen_port: parse_num("WG_LISTEN_PORT", var("WG_LISTEN_PORT"))?,
				private_key_path: var("WG_PRIVATE_KEY_PATH").map(PathBuf::from),
			},
			webserver: WebserverLayer {
				tunnel_listen_address: var("TUNNEL_LISTEN_ADDRESS"),
			},
			xdp: XdpLayer {
				object_path: var("XDP_OBJECT_PATH").map(PathBuf::from),
				pin_path: var("XDP_PIN_PATH").map(PathBuf::from),
				object_sha256: var("XDP_OBJECT_SHA256"),
			},
			database: DatabaseLayer {
				url: var("DATABASE_URL"),
			},
			watcher: WatcherLayer {
				poll_interval_ms: parse_num("WATCHER_POLL_INTERVAL_MS", var("WATCHER_POLL_INTERVAL_MS"))?,
			},
		})
	}

	pub fn merge(&mut self, other: Self) {
		self.wireguard.merge(other.wireguard);
		if other.webserver.tunnel_listen_address.is_some() {
			self.webserver.tunnel_listen_address = other.webserver.tunnel_listen_address;
		}
		if other.xdp.object_path.is_some() {
			self.xdp.object_path = other.xdp.object_path;
		}
		if other.xdp.pin_path.is_some() {
			self.xdp.pin_path = other.xdp.pin_path;
		}
		if other.xdp.object_sha256.is_some() {
			self.xdp.object_sha256 = other.xdp.object_sha256;
		}
		if other.database.url.is_some() {
			self.database.url = other.database.url;
		}
		if other.watcher.poll_interval_ms.is_some() {
			self.watcher.poll_interval_ms = other.watcher.poll_interval_ms;
		}
	}

	pub fn validate(self) -> Result<GatewayConfig, ConfigError> {
		let wg = self.wireguard;

		let dev_name = wg.dev_name.unwrap_or_else(|| DEFAULT_DEV_NAME.to_string());
		if dev_name.is_empty() {
			return Err(ConfigError::MissingValue("wireguard.dev_name".to_string()));
		}
		if dev_name.len() > MAX_DEV_NAME_LEN || dev_name.contains(['/', ' ']) {
			return Err(ConfigError::InvalidValue {
				key: "wireguard.dev_name".to_string(),
				message: format!("{dev_name:?} is not a valid interface name"),
			});
		}

		let range_raw = wg
			.range
			.ok_or_else(|| ConfigError::MissingValue("wireguard.range".to_string()))?;
		let range: IpNet = range_raw.parse().map_err(|_| ConfigError::InvalidValue {
			key: "wireguard.range".to_string(),
			message: format!("{range_raw:?} is not a CIDR"),
		})?;

		let server_raw = wg
			.server_address
			.ok_or_else(|| ConfigError::MissingValue("wireguard.server_address".to_string()))?;
		let server_address: IpAddr = server_raw.parse().map_err(|_| ConfigError::InvalidValue {
			key: "wireguard.server_address".to_string(),
			message: format!("{server_raw:?} is not an IP address"),
		})?;
		if !range.contains(&server_address) {
			return Err(ConfigError::Validation(format!(
				"server address {server_address} is outside tunnel range {range}"
			)));
		}

		let external = wg.external.unwrap_or(false);
		let listen_port = wg.listen_port.unwrap_or(DEFAULT_LISTEN_PORT);
		if !external && listen_port == 0 {
			return Err(ConfigError::InvalidValue {
				key: "wireguard.listen_port".to_string(),
				message: "must be non-zero".to_string(),
			});
		}

		let listen_raw = self
			.webserver
			.tunnel_listen_address
			.unwrap_or_else(|| DEFAULT_TUNNEL_LISTEN_ADDRESS.to_string());
		let tunnel_listen_address: SocketAddr =
			listen_raw.parse().map_err(|_| ConfigError::InvalidValue {
				key: "webserver.tunnel_listen_address".to_string(),
				message: format!("{listen_raw:?} is not host:port"),
			})?;

		let poll_interval_ms = self
			.watcher
			.poll_interval_ms
			.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
		if poll_interval_ms == 0 {
			return Err(ConfigError::InvalidValue {
				key: "watcher.poll_interval_ms".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}

		let object_sha256 = match self.xdp.object_sha256 {
			Some(digest) if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) => {
				return Err(ConfigError::InvalidValue {
					key: "xdp.object_sha256".to_string(),
					message: "expected 64 hex characters".to_string(),
				});
			}
			other => other.map(|d| d.to_ascii_lowercase()),
		};

		Ok(GatewayConfig {
			wireguard: WireguardConfig {
				dev_name,
				range,
				server_address,
				external,
				listen_port,
				private_key_path: wg.private_key_path,
			},
			tunnel_listen_address,
			xdp: XdpConfig {
				object_path: self
					.xdp
					.object_path
					.unwrap_or_else(|| PathBuf::from(DEFAULT_XDP_OBJECT_PATH)),
				pin_path: self
					.xdp
					.pin_path
					.unwrap_or_else(|| PathBuf::from(DEFAULT_XDP_PIN_PATH)),
				object_sha256,
			},
			database_url: self
				.database
				.url
				.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
			poll_interval: Duration::from_millis(poll_interval_ms),
		})
	}
}

fn parse_bool(key: &str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
	value
		.map(|v| match v.to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Ok(true),
			"0" | "false" | "no" | "off" => Ok(false),
			_ => Err(ConfigError::InvalidValue {
				key: format!("{ENV_PREFIX}{key}"),
				message: format!("{v:?} is not a boolean"),
			}),
		})
		.transpose()
}

fn parse_num<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
	T::Err: std::fmt::Display,
{
	value
		.map(|v| {
			v.parse::<T>().map_err(|e| ConfigError::InvalidValue {
				key: format!("{ENV_PREFIX}{key}"),
				message: e.to_string(),
			})
		})
		.transpose()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireguardConfig {
	pub dev_name: String,
	pub range: IpNet,
	/// The gateway's own address inside `range`.
	pub server_address: IpAddr,
	/// The device is created and owned by someone else; we attach only.
	pub external: bool,
	pub listen_port: u16,
	pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XdpConfig {
	pub object_path: PathBuf,
	pub pin_path: PathBuf,
	pub object_sha256: Option<String>,
}

/// Validated gateway configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
	pub wireguard: WireguardConfig,
	/// Management listener reachable from inside the tunnel.
	pub tunnel_listen_address: SocketAddr,
	pub xdp: XdpConfig,
	pub database_url: String,
	pub poll_interval: Duration,
}

impl GatewayConfig {
	/// Loads defaults, the optional file at `path`, then the process
	/// environment, and validates the result.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut layer = GatewayConfigLayer::default();
		if let Some(path) = path {
			layer.merge(GatewayConfigLayer::from_file(path)?);
		}
		layer.merge(GatewayConfigLayer::from_env()?);
		layer.validate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::io::Write;

	const MINIMAL: &str = r#"
[wireguard]
range = "10.0.0.0/24"
server_address = "10.0.0.1"
"#;

	fn layer(toml: &str) -> GatewayConfigLayer {
		GatewayConfigLayer::from_toml_str(toml, Path::new("test.toml")).unwrap()
	}

	fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |name| map.get(name).cloned()
	}

	#[test]
	fn minimal_config_fills_defaults() {
		let config = layer(MINIMAL).validate().unwrap();
		assert_eq!(config.wireguard.dev_name, "wg0");
		assert_eq!(config.wireguard.listen_port, 51820);
		assert!(!config.wireguard.external);
		assert_eq!(config.poll_interval, Duration::from_millis(100));
		assert_eq!(config.tunnel_listen_address.port(), 8080);
		assert!(config.xdp.object_sha256.is_none());
	}

	#[test]
	fn missing_range_is_rejected() {
		let err = GatewayConfigLayer::default().validate().unwrap_err();
		assert!(matches!(err, ConfigError::MissingValue(ref k) if k == "wireguard.range"));
	}

	#[test]
	fn empty_device_name_is_rejected() {
		let mut l = layer(MINIMAL);
		l.wireguard.dev_name = Some(String::new());
		assert!(matches!(l.validate(), Err(ConfigError::MissingValue(_))));
	}

	#[test]
	fn overlong_device_name_is_rejected() {
		let mut l = layer(MINIMAL);
		l.wireguard.dev_name = Some("a-very-long-interface".to_string());
		assert!(matches!(l.validate(), Err(ConfigError::InvalidValue { .. })));
	}

	#[test]
	fn bad_cidr_is_rejected() {
		let mut l = layer(MINIMAL);
		l.wireguard.range = Some("10.0.0.0/33".to_string());
		let err = l.validate().unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "wireguard.range"));
	}

	#[test]
	fn server_address_outside_range_is_rejected() {
		let mut l = layer(MINIMAL);
		l.wireguard.server_address = Some("10.0.1.1".to_string());
		assert!(matches!(l.validate(), Err(ConfigError::Validation(_))));
	}

	#[test]
	fn zero_poll_interval_is_rejected() {
		let mut l = layer(MINIMAL);
		l.watcher.poll_interval_ms = Some(0);
		assert!(matches!(l.validate(), Err(ConfigError::InvalidValue { .. })));
	}

	#[test]
	fn bad_management_address_is_rejected() {
		let mut l = layer(MINIMAL);
		l.webserver.tunnel_listen_address = Some("not-an-address".to_string());
		let err = l.validate().unwrap_err();
		assert!(
			matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "webserver.tunnel_listen_address")
		);
	}

	#[test]
	fn bad_digest_is_rejected() {
		let mut l = layer(MINIMAL);
		l.xdp.object_sha256 = Some("abc".to_string());
		assert!(l.validate().is_err());
	}

	#[test]
	fn env_overrides_file() {
		let mut l = layer(MINIMAL);
		l.merge(
			GatewayConfigLayer::from_env_with(env(&[
				("TOLLGATE_WG_DEV_NAME", "wg-test"),
				("TOLLGATE_WG_EXTERNAL", "true"),
				("TOLLGATE_WATCHER_POLL_INTERVAL_MS", "250"),
				("TOLLGATE_DATABASE_URL", "sqlite::memory:"),
			]))
			.unwrap(),
		);
		let config = l.validate().unwrap();
		assert_eq!(config.wireguard.dev_name, "wg-test");
		assert!(config.wireguard.external);
		assert_eq!(config.wireguard.range.to_string(), "10.0.0.0/24");
		assert_eq!(config.poll_interval, Duration::from_millis(250));
		assert_eq!(config.database_url, "sqlite::memory:");
	}

	#[test]
	fn empty_env_values_are_ignored() {
		let env_layer =
			GatewayConfigLayer::from_env_with(env(&[("TOLLGATE_WG_DEV_NAME", "  ")])).unwrap();
		assert!(env_layer.wireguard.dev_name.is_none());
	}

	#[test]
	fn malformed_env_values_are_errors() {
		let err = GatewayConfigLayer::from_env_with(env(&[("TOLLGATE_WG_LISTEN_PORT", "99999")]))
			.unwrap_err();
		assert!(
			matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TOLLGATE_WG_LISTEN_PORT")
		);

		let err =
			GatewayConfigLayer::from_env_with(env(&[("TOLLGATE_WG_EXTERNAL", "maybe")])).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn reads_file_from_disk() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			"{MINIMAL}\n[xdp]\nobject_path = \"/tmp/xdp.o\"\n[watcher]\npoll_interval_ms = 50\n"
		)
		.unwrap();

		let config = GatewayConfigLayer::from_file(file.path())
			.unwrap()
			.validate()
			.unwrap();
		assert_eq!(config.xdp.object_path, PathBuf::from("/tmp/xdp.o"));
		assert_eq!(config.poll_interval, Duration::from_millis(50));
	}

	#[test]
	fn unreadable_file_reports_path() {
		let err = GatewayConfigLayer::from_file(Path::new("/nonexistent/tollgate.toml")).unwrap_err();
		assert!(matches!(err, ConfigError::FileRead { .. }));
	}

	#[test]
	fn invalid_toml_is_parse_error() {
		let err = GatewayConfigLayer::from_toml_str("[wireguard\n", Path::new("bad.toml")).unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}
}
