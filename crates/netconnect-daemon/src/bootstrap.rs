// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::DaemonConfig;
use crate::egress::{self, CompanionEgress};
use crate::error::BootstrapError;
use crate::remote::{CompanionSpec, RemoteRunner};
use crate::tunnel::{TunnelConfig, TunnelDevice, TunnelProvider};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use netconnect_common::{SecretString, WgKeyPair};
use netconnect_engine::{bridge_interface, Bootstrap, NetworkSource};
use netconnect_rules::{EgressBinding, RuleExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

pub const REMOTE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Brings the host end of the tunnel up and hands the VM end its
/// configuration through the companion container.
pub struct TunnelBootstrap<X, R, S> {
	config: DaemonConfig,
	provider: Box<dyn TunnelProvider>,
	executor: X,
	egress: Arc<CompanionEgress<R>>,
	source: S,
	device: Option<Box<dyn TunnelDevice>>,
	retry_delay: Duration,
}

impl<X, R, S> TunnelBootstrap<X, R, S>
where
	X: RuleExecutor,
	R: RemoteRunner,
	S: NetworkSource,
{
	pub fn new(
		config: DaemonConfig,
		provider: Box<dyn TunnelProvider>,
		executor: X,
		remote: R,
		source: S,
	) -> Self {
		Self {
			config,
			provider,
			executor,
			egress: Arc::new(CompanionEgress::new(Arc::new(remote))),
			source,
			device: None,
			retry_delay: REMOTE_RETRY_DELAY,
		}
	}

	pub fn with_retry_delay(mut self, delay: Duration) -> Self {
		self.retry_delay = delay;
		self
	}

	pub fn interface(&self) -> Option<&str> {
		self.device.as_deref().map(|d| d.name())
	}

	pub fn remote(&self) -> &R {
		self.egress.remote()
	}

	/// Follows binding changes after bootstrap; hand it to the engine.
	pub fn egress(&self) -> Arc<CompanionEgress<R>> {
		Arc::clone(&self.egress)
	}

	/// Deletes the tunnel interface if one was created.
	pub async fn teardown(&mut self) {
		if let Some(mut device) = self.device.take() {
			let name = device.name().to_string();
			match device.close().await {
				Ok(()) => info!(interface = %name, "tunnel interface removed"),
				Err(e) => warn!(interface = %name, error = %e, "failed to remove tunnel interface"),
			}
		}
	}

	fn derive_keys(&self) -> Result<(WgKeyPair, WgKeyPair), BootstrapError> {
		let supplied = |key: &Option<SecretString>| key.as_ref().map(|k| k.expose().clone());
		let host_key = supplied(&self.config.host_private_key);
		let vm_key = supplied(&self.config.vm_private_key);
		let host = WgKeyPair::supplied_or_generate(host_key.as_deref())?;
		let vm = WgKeyPair::supplied_or_generate(vm_key.as_deref())?;
		info!(
			host_public_key = %host.public_key(),
			vm_public_key = %vm.public_key(),
			"tunnel keys ready"
		);
		Ok((host, vm))
	}

	fn host_tunnel(&self, host: &WgKeyPair, vm: &WgKeyPair) -> TunnelConfig {
		TunnelConfig {
			private_key: host.private_key().clone(),
			listen_port: Some(self.config.server_port),
			peer_public_key: *vm.public_key(),
			peer_endpoint: None,
			persistent_keepalive: None,
			allowed_ips: vec![
				Ipv4Net::default(),
				Ipv4Net::from(self.config.vm_peer_ip),
			],
		}
	}

	/// Container subnets and the bridges behind them, listed fresh on every
	/// attempt.
	async fn listed_bindings(&self) -> Vec<EgressBinding> {
		let networks = match self.source.list().await {
			Ok(networks) => networks,
			Err(e) => {
				warn!(error = %e, "could not list networks for the companion");
				return Vec::new();
			}
		};
		let mut bindings: Vec<_> = networks
			.iter()
			.flat_map(|network| {
				let bridge = bridge_interface(network);
				network
					.eligible_subnets()
					.into_iter()
					.map(move |cidr| EgressBinding::new(cidr, bridge.clone()))
			})
			.collect();
		bindings.sort();
		bindings.dedup();
		bindings
	}

	/// Companion environment apart from the binding lists.
	fn companion(&self, host: &WgKeyPair, vm: &WgKeyPair) -> CompanionSpec {
		let mut spec = CompanionSpec::new(&self.config.setup_image)
			.env("SERVER_PORT", self.config.server_port)
			.env("HOST_PEER_IP", self.config.host_peer_ip)
			.env("VM_PEER_IP", self.config.vm_peer_ip)
			.env("HOST_PUBLIC_KEY", host.public_key().to_base64())
			.secret_env("VM_PRIVATE_KEY", vm.private_key().to_base64())
			.env("ENABLE_DOCKER_FILTER", self.config.docker_filter);
		if let Some(bridge) = &self.config.bridge {
			spec = spec
				.env("BRIDGE_IP", bridge.address)
				.env("BRIDGE_INTERFACE", &bridge.interface);
		}
		if let Some(level) = &self.config.log_level {
			spec = spec.env("LOG_LEVEL", level);
		}
		spec
	}
}

#[async_trait]
impl<X, R, S> Bootstrap for TunnelBootstrap<X, R, S>
where
	X: RuleExecutor,
	R: RemoteRunner,
	S: NetworkSource,
{
	type Error = BootstrapError;

	#[instrument(skip_all, fields(requested = %self.config.interface_name))]
	async fn bootstrap(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<String, BootstrapError> {
		let device = self.provider.create(&self.config.interface_name).await?;
		let interface = device.name().to_string();
		self.device = Some(device);

		let (host, vm) = self.derive_keys()?;

		let tunnel = self.host_tunnel(&host, &vm);
		if let Some(device) = self.device.as_deref() {
			device.configure(&tunnel).await?;
		}

		self
			.executor
			.set_point_to_point_address(self.config.host_peer_ip, self.config.vm_peer_ip, &interface)
			.await?;
		if let Err(e) = self
			.executor
			.add_route(Ipv4Net::from(self.config.vm_peer_ip), &interface)
			.await
		{
			warn!(%interface, error = %e, "failed to add host route to the VM end");
		}
		info!(%interface, local = %self.config.host_peer_ip, peer = %self.config.vm_peer_ip, "tunnel interface up");

		let base = self.companion(&host, &vm);
		loop {
			let bindings = self.listed_bindings().await;
			let spec = egress::with_bindings(base.clone(), &bindings, &[]);
			match self.remote().run_to_completion(&spec).await {
				Ok(()) => {
					self.egress.installed(base, bindings).await;
					break;
				}
				Err(e) => warn!(
					error = %e,
					retry_in = ?self.retry_delay,
					"remote setup failed"
				),
			}
			tokio::select! {
				biased;
				_ = shutdown.wait_for(|stop| *stop) => return Err(BootstrapError::Shutdown),
				_ = tokio::time::sleep(self.retry_delay) => {}
			}
		}

		Ok(interface)
	}
}
