// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The kernel WireGuard link on the VM side, driven through iproute2 and
//! `wg(8)`.

use crate::config::{SetupConfig, KEEPALIVE_SECS};
use crate::error::{Result, SetupError};
use ipnet::Ipv4Net;
use netconnect_rules::command::{args, run_checked};
use netconnect_rules::{CommandRunner, RouteSyntax, RuleExecutor, UnixExecutor};
use std::io::Write;
use std::net::SocketAddr;
use tracing::{debug, info, instrument};

/// Resolves `host:port`, preferring an IPv4 answer.
#[instrument]
pub async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
	let resolve_error = |reason: String| SetupError::Resolve {
		endpoint: endpoint.to_string(),
		reason,
	};
	let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
		.await
		.map_err(|e| resolve_error(e.to_string()))?
		.collect();
	addrs
		.iter()
		.find(|a| a.is_ipv4())
		.or_else(|| addrs.first())
		.copied()
		.ok_or_else(|| resolve_error("no addresses".to_string()))
}

pub struct VmTunnel<R> {
	executor: UnixExecutor<R>,
}

impl<R> VmTunnel<R>
where
	R: CommandRunner,
{
	pub fn new(runner: R) -> Self {
		Self {
			executor: UnixExecutor::with_syntax(runner, RouteSyntax::Iproute2),
		}
	}

	pub fn executor(&self) -> &UnixExecutor<R> {
		&self.executor
	}

	async fn link_exists(&self, name: &str) -> Result<bool> {
		let raw = self
			.executor
			.runner()
			.run("ip", &args(["link", "show", "dev", name]))
			.await
			.map_err(|source| netconnect_rules::RuleError::Spawn {
				program: "ip".to_string(),
				source,
			})?;
		Ok(raw.success)
	}

	/// Deletes a link left behind by an earlier run.
	pub async fn remove_stale(&self, name: &str) -> Result<()> {
		if self.link_exists(name).await? {
			info!(interface = %name, "interface already exists, removing");
			run_checked(self.executor.runner(), "ip", &args(["link", "del", "dev", name])).await?;
		}
		Ok(())
	}

	/// Creates, addresses and configures the link, then brings it up.
	#[instrument(skip_all, fields(interface = %config.interface_name, %endpoint))]
	pub async fn bring_up(&self, config: &SetupConfig, endpoint: SocketAddr) -> Result<()> {
		let name = config.interface_name.as_str();
		self.remove_stale(name).await?;

		run_checked(
			self.executor.runner(),
			"ip",
			&args(["link", "add", "dev", name, "type", "wireguard"]),
		)
		.await?;

		self.executor
			.set_point_to_point_address(config.vm_peer_ip, config.host_peer_ip, name)
			.await?;

		self.configure_peer(config, endpoint).await?;

		run_checked(self.executor.runner(), "ip", &args(["link", "set", "dev", name, "up"])).await?;
		info!(
			local = %config.vm_peer_ip,
			peer = %config.host_peer_ip,
			public_key = %config.vm_keypair.public_key(),
			"tunnel interface up"
		);
		Ok(())
	}

	async fn configure_peer(&self, config: &SetupConfig, endpoint: SocketAddr) -> Result<()> {
		// wg(8) only reads private keys from files.
		let mut key_file = tempfile::NamedTempFile::new().map_err(SetupError::KeyFile)?;
		writeln!(key_file, "{}", config.vm_keypair.private_key().to_base64().expose())
			.map_err(SetupError::KeyFile)?;
		key_file.flush().map_err(SetupError::KeyFile)?;

		let allowed_ips = [Ipv4Net::default(), Ipv4Net::from(config.host_peer_ip)]
			.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>()
			.join(",");
		let argv = args([
			"set".to_string(),
			config.interface_name.clone(),
			"private-key".to_string(),
			key_file.path().display().to_string(),
			"peer".to_string(),
			config.host_public_key.to_base64(),
			"endpoint".to_string(),
			endpoint.to_string(),
			"persistent-keepalive".to_string(),
			KEEPALIVE_SECS.to_string(),
			"allowed-ips".to_string(),
			allowed_ips,
		]);
		run_checked(self.executor.runner(), "wg", &argv).await?;
		debug!(peer = %config.host_public_key, "peer configured");
		Ok(())
	}
}
