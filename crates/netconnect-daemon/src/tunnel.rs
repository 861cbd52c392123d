// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The tunnel device seam and the WireGuard cross-platform control protocol
//! used to configure it.

use crate::error::TunnelError;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use netconnect_common::{Secret, WgPrivateKey, WgPublicKey};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub const UAPI_SOCKET_DIR: &str = "/var/run/wireguard";

/// Everything needed to bring one end of the tunnel up.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
	pub private_key: WgPrivateKey,
	pub listen_port: Option<u16>,
	pub peer_public_key: WgPublicKey,
	pub peer_endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
	pub allowed_ips: Vec<Ipv4Net>,
}

impl TunnelConfig {
	/// Renders a `set=1` request replacing any existing peers.
	pub fn uapi_request(&self) -> Secret<String> {
		let mut out = String::from("set=1\n");
		let _ = writeln!(out, "private_key={}", self.private_key.to_hex().expose());
		if let Some(port) = self.listen_port {
			let _ = writeln!(out, "listen_port={port}");
		}
		out.push_str("replace_peers=true\n");
		let _ = writeln!(out, "public_key={}", self.peer_public_key.to_hex());
		if let Some(endpoint) = self.peer_endpoint {
			let _ = writeln!(out, "endpoint={endpoint}");
		}
		if let Some(keepalive) = self.persistent_keepalive {
			let _ = writeln!(out, "persistent_keepalive_interval={keepalive}");
		}
		out.push_str("replace_allowed_ips=true\n");
		for ip in &self.allowed_ips {
			let _ = writeln!(out, "allowed_ip={ip}");
		}
		out.push('\n');
		Secret::new(out)
	}
}

/// Interprets a control socket response, which ends with an `errno=` line.
pub fn parse_uapi_response(response: &str) -> Result<(), TunnelError> {
	let errno = response
		.lines()
		.find_map(|line| line.strip_prefix("errno="))
		.ok_or_else(|| TunnelError::Protocol(response.trim().to_string()))?;
	match errno.trim().parse::<i32>() {
		Ok(0) => Ok(()),
		Ok(code) => Err(TunnelError::Rejected(code)),
		Err(_) => Err(TunnelError::Protocol(format!("errno={errno}"))),
	}
}

pub fn uapi_socket_path(dir: &Path, interface: &str) -> PathBuf {
	dir.join(format!("{interface}.sock"))
}

/// Sends `config` to the control socket at `socket` and waits for the
/// device's verdict.
#[cfg(unix)]
#[instrument(skip(config))]
pub async fn configure_over_uapi(socket: &Path, config: &TunnelConfig) -> Result<(), TunnelError> {
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	let mut stream = tokio::net::UnixStream::connect(socket).await?;
	stream
		.write_all(config.uapi_request().expose().as_bytes())
		.await?;

	let mut reader = BufReader::new(stream);
	let mut response = String::new();
	loop {
		let mut line = String::new();
		if reader.read_line(&mut line).await? == 0 || line == "\n" {
			break;
		}
		response.push_str(&line);
	}
	debug!(response = %response.trim(), "control socket answered");
	parse_uapi_response(&response)
}

/// A live tunnel interface.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
	/// The name the kernel assigned, which can differ from the one requested.
	fn name(&self) -> &str;

	async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError>;

	/// Tears the interface down. Calling it twice is harmless.
	async fn close(&mut self) -> Result<(), TunnelError>;
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
	async fn create(&self, requested_name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError>;
}
