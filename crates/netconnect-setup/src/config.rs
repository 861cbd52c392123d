// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use netconnect_common::{WgKeyPair, WgPublicKey};
use netconnect_rules::{BridgeForward, EgressBinding, FirewallPolicy};
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const DEFAULT_INTERFACE: &str = "chip0";
pub const HOST_ALIAS: &str = "host.docker.internal";
pub const KEEPALIVE_SECS: u16 = 25;

/// How much of the VM end a run touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupScope {
	/// Rebuild the tunnel link, then install the egress rules.
	#[default]
	Full,
	/// Leave the link alone and only bring the egress rules up to date.
	Egress,
}

impl FromStr for SetupScope {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_lowercase().as_str() {
			"full" => Ok(SetupScope::Full),
			"egress" => Ok(SetupScope::Egress),
			other => Err(format!("unknown scope {other:?}")),
		}
	}
}

/// Settings handed over by the host daemon through the environment.
#[derive(Debug, Clone)]
pub struct SetupConfig {
	pub interface_name: String,
	pub server_port: u16,
	pub host_peer_ip: Ipv4Addr,
	pub vm_peer_ip: Ipv4Addr,
	pub host_public_key: WgPublicKey,
	pub vm_keypair: WgKeyPair,
	pub egress: Vec<EgressBinding>,
	/// Bindings that went away since the previous run; their rules are removed.
	pub stale: Vec<EgressBinding>,
	pub scope: SetupScope,
	pub docker_filter: bool,
	pub bridge: Option<BridgeForward>,
	pub log_level: Option<String>,
}

impl SetupConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds the configuration from any key/value source. Blank values count
	/// as unset.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
		let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnv(key.to_string()));

		let server_port = parse("SERVER_PORT", &require("SERVER_PORT")?)?;

		let host_peer_ip = match get("HOST_PEER_IP") {
			Some(raw) => parse("HOST_PEER_IP", &raw)?,
			None => Ipv4Addr::new(10, 33, 33, 1),
		};
		let vm_peer_ip = match get("VM_PEER_IP") {
			Some(raw) => parse("VM_PEER_IP", &raw)?,
			None => Ipv4Addr::new(10, 33, 33, 2),
		};

		let host_public_key = WgPublicKey::from_base64(require("HOST_PUBLIC_KEY")?.trim())
			.map_err(|e| ConfigError::Parse(format!("invalid HOST_PUBLIC_KEY: {e}")))?;
		let vm_keypair = WgKeyPair::from_base64(require("VM_PRIVATE_KEY")?.trim())
			.map_err(|e| ConfigError::Parse(format!("invalid VM_PRIVATE_KEY: {e}")))?;

		let cidrs = get("DOCKER_CIDRS").unwrap_or_default();
		let interfaces = get("DOCKER_INTERFACES");
		let egress = EgressBinding::parse_list(&cidrs, interfaces.as_deref())
			.map_err(|e| ConfigError::Parse(e.to_string()))?;
		let stale = EgressBinding::parse_list(
			&get("STALE_CIDRS").unwrap_or_default(),
			get("STALE_INTERFACES").as_deref(),
		)
		.map_err(|e| ConfigError::Parse(format!("stale bindings: {e}")))?;
		let scope = match get("SETUP_SCOPE") {
			Some(raw) => parse("SETUP_SCOPE", &raw)?,
			None => SetupScope::Full,
		};

		let docker_filter = get("ENABLE_DOCKER_FILTER")
			.map(|v| v != "0" && v.to_lowercase() != "false")
			.unwrap_or(false);

		// Both halves or nothing; a lone half is ignored.
		let bridge = match (get("BRIDGE_IP"), get("BRIDGE_INTERFACE")) {
			(Some(address), Some(interface)) => Some(BridgeForward {
				address: parse("BRIDGE_IP", &address)?,
				interface: interface.trim().to_string(),
			}),
			_ => None,
		};

		Ok(Self {
			interface_name: get("INTERFACE_NAME").unwrap_or_else(|| DEFAULT_INTERFACE.to_string()),
			server_port,
			host_peer_ip,
			vm_peer_ip,
			host_public_key,
			vm_keypair,
			egress,
			stale,
			scope,
			docker_filter,
			bridge,
			log_level: get("LOG_LEVEL"),
		})
	}

	/// Traffic from the host end is masqueraded into the container subnets.
	pub fn firewall_policy(&self) -> FirewallPolicy {
		FirewallPolicy::new(self.host_peer_ip)
			.with_filter(self.docker_filter)
			.with_bridge(self.bridge.clone())
	}

	pub fn host_endpoint(&self) -> String {
		format!("{HOST_ALIAS}:{}", self.server_port)
	}
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
	T: FromStr,
	T::Err: std::fmt::Display,
{
	raw.trim()
		.parse()
		.map_err(|e| ConfigError::Parse(format!("invalid {key}: {e}")))
}
