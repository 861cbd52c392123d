// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use netconnect_common::SecretString;
use netconnect_engine::ForwardingMode;
use netconnect_rules::{BridgeForward, FirewallPolicy};
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_SETUP_IMAGE: &str = "ghcr.io/chipmk/docker-mac-net-connect/setup:latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RouteMode {
	/// Route every container subnet through the tunnel interface.
	Tunnel,
	/// Route each network through its own bridge interface.
	Bridge,
}

/// Bridges the host network with container networks inside the VM
#[derive(Parser, Debug, Clone)]
#[command(name = "netconnect", version)]
pub struct Args {
	/// Requested tunnel interface name; the kernel may append a unit number
	#[arg(long, env = "INTERFACE_NAME", default_value = "utun")]
	pub interface_name: String,

	/// UDP port the host end of the tunnel listens on
	#[arg(long, env = "SERVER_PORT", default_value_t = 3333)]
	pub server_port: u16,

	/// Point-to-point address of the host end
	#[arg(long, env = "HOST_PEER_IP", default_value = "10.33.33.1")]
	pub host_peer_ip: Ipv4Addr,

	/// Point-to-point address of the VM end
	#[arg(long, env = "VM_PEER_IP", default_value = "10.33.33.2")]
	pub vm_peer_ip: Ipv4Addr,

	/// Base64 private key for the host end; generated when absent
	#[arg(long, env = "HOST_PRIVATE_KEY", hide_env_values = true)]
	pub host_private_key: Option<String>,

	/// Base64 private key for the VM end; generated when absent
	#[arg(long, env = "VM_PRIVATE_KEY", hide_env_values = true)]
	pub vm_private_key: Option<String>,

	/// Image of the companion container that configures the VM end
	#[arg(long, env = "SETUP_IMAGE", default_value = DEFAULT_SETUP_IMAGE)]
	pub setup_image: String,

	/// Where host routes for container subnets point
	#[arg(long, env = "ROUTE_MODE", value_enum, default_value_t = RouteMode::Tunnel)]
	pub route_mode: RouteMode,

	/// Also keep NAT/filter rules on this host (requires iptables)
	#[arg(long, env = "ENABLE_HOST_FIREWALL")]
	pub enable_host_firewall: bool,

	/// Add filter-chain accept rules for tunnel traffic
	#[arg(long, env = "ENABLE_DOCKER_FILTER")]
	pub enable_docker_filter: bool,

	/// Address of a bridge whose traffic should also be accepted
	#[arg(long, env = "BRIDGE_IP")]
	pub bridge_ip: Option<Ipv4Addr>,

	/// Interface of that bridge
	#[arg(long, env = "BRIDGE_INTERFACE")]
	pub bridge_interface: Option<String>,

	/// Seconds to wait before a full resync after the event stream breaks
	#[arg(long, env = "RESYNC_DELAY_SECS", default_value_t = 5)]
	pub resync_delay_secs: u64,

	/// Log verbosity: verbose, debug, error, silent or info
	#[arg(long, env = "LOG_LEVEL")]
	pub log_level: Option<String>,
}

/// Validated daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
	pub interface_name: String,
	pub server_port: u16,
	pub host_peer_ip: Ipv4Addr,
	pub vm_peer_ip: Ipv4Addr,
	pub host_private_key: Option<SecretString>,
	pub vm_private_key: Option<SecretString>,
	pub setup_image: String,
	pub forwarding: ForwardingMode,
	pub host_firewall: bool,
	pub docker_filter: bool,
	pub bridge: Option<BridgeForward>,
	pub resync_delay: Duration,
	pub log_level: Option<String>,
}

impl TryFrom<Args> for DaemonConfig {
	type Error = ConfigError;

	fn try_from(args: Args) -> Result<Self, ConfigError> {
		let bridge = match (args.bridge_ip, non_blank(args.bridge_interface)) {
			(Some(address), Some(interface)) => Some(BridgeForward { address, interface }),
			(None, None) => None,
			_ => return Err(ConfigError::IncompleteBridge),
		};

		if args.host_peer_ip == args.vm_peer_ip {
			return Err(ConfigError::Parse(format!(
				"HOST_PEER_IP and VM_PEER_IP are both {}",
				args.host_peer_ip
			)));
		}
		if args.interface_name.trim().is_empty() {
			return Err(ConfigError::Parse("INTERFACE_NAME is empty".to_string()));
		}

		Ok(Self {
			interface_name: args.interface_name,
			server_port: args.server_port,
			host_peer_ip: args.host_peer_ip,
			vm_peer_ip: args.vm_peer_ip,
			host_private_key: non_blank(args.host_private_key).map(SecretString::from),
			vm_private_key: non_blank(args.vm_private_key).map(SecretString::from),
			setup_image: args.setup_image,
			forwarding: match args.route_mode {
				RouteMode::Tunnel => ForwardingMode::Tunnel,
				RouteMode::Bridge => ForwardingMode::PerNetwork,
			},
			host_firewall: args.enable_host_firewall,
			docker_filter: args.enable_docker_filter,
			bridge,
			resync_delay: Duration::from_secs(args.resync_delay_secs),
			log_level: non_blank(args.log_level),
		})
	}
}

impl DaemonConfig {
	/// Rules the host keeps for each tracked network, if host firewalling is
	/// enabled. The host masquerades traffic arriving from the VM end.
	pub fn firewall_policy(&self) -> Option<FirewallPolicy> {
		self.host_firewall.then(|| {
			FirewallPolicy::new(self.vm_peer_ip)
				.with_filter(self.docker_filter)
				.with_bridge(self.bridge.clone())
		})
	}
}

fn non_blank(value: Option<String>) -> Option<String> {
	value.filter(|v| !v.trim().is_empty())
}
