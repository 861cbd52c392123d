// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace WireGuard device backed by boringtun.
//!
//! The device owns its TUN file descriptor, its worker threads and a control
//! socket under [`UAPI_SOCKET_DIR`]. It lives on a dedicated thread for its
//! whole lifetime; dropping it there closes the interface and removes the
//! socket.

use crate::error::TunnelError;
use crate::tunnel::{TunnelDevice, TunnelProvider, UAPI_SOCKET_DIR};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SOCKET_POLL_ATTEMPTS: u32 = 60;

/// Lists the interface names that currently have a control socket.
pub fn socket_names(dir: &Path) -> HashSet<String> {
	let Ok(entries) = std::fs::read_dir(dir) else {
		return HashSet::new();
	};
	entries
		.filter_map(|entry| entry.ok())
		.filter_map(|entry| {
			let name = entry.file_name().into_string().ok()?;
			name.strip_suffix(".sock").map(str::to_string)
		})
		.collect()
}

/// Picks the interface created for `requested` by comparing control sockets
/// before and after creation. An exact match wins, otherwise the new socket
/// sharing the requested prefix (`utun` becomes `utun4`).
pub fn discover_interface(
	requested: &str,
	before: &HashSet<String>,
	after: &HashSet<String>,
) -> Option<String> {
	let mut created: Vec<&String> = after.difference(before).collect();
	created.sort();
	if created.iter().any(|name| name.as_str() == requested) {
		return Some(requested.to_string());
	}
	created
		.into_iter()
		.find(|name| name.starts_with(requested))
		.cloned()
}

#[cfg(unix)]
pub use imp::{BoringtunProvider, UserspaceTunnel};

#[cfg(unix)]
mod imp {
	use super::*;
	use crate::tunnel::{configure_over_uapi, uapi_socket_path, TunnelConfig};
	use defguard_boringtun::device::{DeviceConfig, DeviceHandle};
	use std::sync::mpsc;
	use tokio::sync::oneshot;
	use tracing::{debug, info, instrument, warn};

	pub struct BoringtunProvider {
		socket_dir: PathBuf,
	}

	impl BoringtunProvider {
		pub fn new() -> Self {
			Self {
				socket_dir: PathBuf::from(UAPI_SOCKET_DIR),
			}
		}
	}

	impl Default for BoringtunProvider {
		fn default() -> Self {
			Self::new()
		}
	}

	#[async_trait]
	impl TunnelProvider for BoringtunProvider {
		#[instrument(skip(self))]
		async fn create(&self, requested_name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError> {
			let before = socket_names(&self.socket_dir);

			let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
			let (stop_tx, stop_rx) = mpsc::channel::<()>();
			let requested = requested_name.to_string();

			let worker = std::thread::Builder::new()
				.name("wg-device".to_string())
				.spawn(move || match DeviceHandle::new(&requested, DeviceConfig::default()) {
					Ok(handle) => {
						let _ = ready_tx.send(Ok(()));
						let _ = stop_rx.recv();
						drop(handle);
					}
					Err(e) => {
						let _ = ready_tx.send(Err(format!("{e:?}")));
					}
				})?;

			let outcome = ready_rx.await.unwrap_or_else(|_| {
				Err("device thread exited before reporting".to_string())
			});
			if let Err(reason) = outcome {
				let _ = worker.join();
				return Err(TunnelError::Create {
					name: requested_name.to_string(),
					reason,
				});
			}

			let mut tunnel = UserspaceTunnel {
				name: String::new(),
				socket: PathBuf::new(),
				stop: Some(stop_tx),
				worker: Some(worker),
			};

			for _ in 0..SOCKET_POLL_ATTEMPTS {
				let after = socket_names(&self.socket_dir);
				if let Some(name) = discover_interface(requested_name, &before, &after) {
					info!(interface = %name, "tunnel device created");
					tunnel.socket = uapi_socket_path(&self.socket_dir, &name);
					tunnel.name = name;
					return Ok(Box::new(tunnel));
				}
				tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
			}

			tunnel.shutdown();
			Err(TunnelError::SocketMissing(requested_name.to_string()))
		}
	}

	pub struct UserspaceTunnel {
		name: String,
		socket: PathBuf,
		stop: Option<mpsc::Sender<()>>,
		worker: Option<std::thread::JoinHandle<()>>,
	}

	impl UserspaceTunnel {
		fn shutdown(&mut self) -> Option<std::thread::JoinHandle<()>> {
			if let Some(stop) = self.stop.take() {
				let _ = stop.send(());
			}
			self.worker.take()
		}
	}

	#[async_trait]
	impl TunnelDevice for UserspaceTunnel {
		fn name(&self) -> &str {
			&self.name
		}

		async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError> {
			configure_over_uapi(&self.socket, config).await?;
			debug!(interface = %self.name, "tunnel configured");
			Ok(())
		}

		#[instrument(skip(self), fields(interface = %self.name))]
		async fn close(&mut self) -> Result<(), TunnelError> {
			let Some(worker) = self.shutdown() else {
				return Ok(());
			};
			match tokio::task::spawn_blocking(move || worker.join()).await {
				Ok(Ok(())) => info!("tunnel device closed"),
				_ => warn!("tunnel device thread did not exit cleanly"),
			}
			Ok(())
		}
	}

	impl Drop for UserspaceTunnel {
		fn drop(&mut self) {
			self.shutdown();
		}
	}
}

/// Provider for platforms without a userspace device.
#[cfg(not(unix))]
#[derive(Default)]
pub struct UnsupportedProvider;

#[cfg(not(unix))]
#[async_trait]
impl TunnelProvider for UnsupportedProvider {
	async fn create(&self, _requested_name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError> {
		Err(TunnelError::Unsupported)
	}
}

pub fn platform_provider() -> Box<dyn TunnelProvider> {
	#[cfg(unix)]
	{
		Box::new(BoringtunProvider::new())
	}
	#[cfg(not(unix))]
	{
		Box::new(UnsupportedProvider)
	}
}
