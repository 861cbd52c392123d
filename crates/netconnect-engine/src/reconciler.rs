// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result, SourceError};
use crate::interface::{bridge_interface, ForwardingMode};
use crate::network::NetworkRecord;
use crate::registry::{NetworkRegistry, TrackedNetwork};
use crate::source::{EventStream, NetworkEvent, NetworkSource};
use async_trait::async_trait;
use futures::StreamExt;
use netconnect_rules::{EgressBinding, FirewallPolicy, RuleExecutor};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_RESYNC_DELAY: Duration = Duration::from_secs(5);

/// Brings up the tunnel before reconciliation starts.
#[async_trait]
pub trait Bootstrap: Send {
	type Error: std::error::Error + Send + Sync + 'static;

	/// Returns the name of the tunnel interface once it is up. Implementations
	/// that retry should give up when `shutdown` flips to `true`.
	async fn bootstrap(&mut self, shutdown: watch::Receiver<bool>)
		-> std::result::Result<String, Self::Error>;
}

/// Told about the full set of egress bindings after every sync and every
/// applied event, whether or not it changed.
#[async_trait]
pub trait EgressObserver: Send + Sync {
	async fn egress_changed(&self, bindings: &[EgressBinding]);
}

#[async_trait]
impl<T> EgressObserver for Arc<T>
where
	T: EgressObserver + ?Sized,
{
	async fn egress_changed(&self, bindings: &[EgressBinding]) {
		(**self).egress_changed(bindings).await
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
	Bootstrapping,
	Syncing,
	Watching,
	Error { reason: String },
	ShuttingDown,
}

impl fmt::Display for EngineState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EngineState::Bootstrapping => write!(f, "bootstrapping"),
			EngineState::Syncing => write!(f, "syncing"),
			EngineState::Watching => write!(f, "watching"),
			EngineState::Error { .. } => write!(f, "error"),
			EngineState::ShuttingDown => write!(f, "shutting down"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
	pub mode: ForwardingMode,
	/// Delay between a failed listing or broken watch and the next full sync.
	pub resync_delay: Duration,
	/// Firewall rules to keep per tracked network. `None` manages routes only.
	pub firewall: Option<FirewallPolicy>,
}

impl Default for ReconcilerConfig {
	fn default() -> Self {
		Self {
			mode: ForwardingMode::Tunnel,
			resync_delay: DEFAULT_RESYNC_DELAY,
			firewall: None,
		}
	}
}

/// Outcome of one full listing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
	pub tracked: usize,
	pub pruned: usize,
	pub failed_routes: usize,
}

/// Drives host routes and firewall rules towards the set of networks the
/// source reports.
pub struct Reconciler<S, E> {
	source: S,
	executor: E,
	config: ReconcilerConfig,
	registry: NetworkRegistry,
	tunnel_interface: Option<String>,
	state: EngineState,
	/// Subscription opened ahead of a listing, consumed by the next watch.
	events: Option<EventStream>,
	observer: Option<Box<dyn EgressObserver>>,
	shutdown: watch::Receiver<bool>,
}

impl<S, E> Reconciler<S, E>
where
	S: NetworkSource,
	E: RuleExecutor,
{
	pub fn new(
		source: S,
		executor: E,
		config: ReconcilerConfig,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		Self {
			source,
			executor,
			config,
			registry: NetworkRegistry::new(),
			tunnel_interface: None,
			state: EngineState::Bootstrapping,
			events: None,
			observer: None,
			shutdown,
		}
	}

	pub fn with_egress_observer(mut self, observer: impl EgressObserver + 'static) -> Self {
		self.observer = Some(Box::new(observer));
		self
	}

	pub fn state(&self) -> &EngineState {
		&self.state
	}

	pub fn registry(&self) -> &NetworkRegistry {
		&self.registry
	}

	pub fn executor(&self) -> &E {
		&self.executor
	}

	pub fn source(&self) -> &S {
		&self.source
	}

	pub fn tunnel_interface(&self) -> Option<&str> {
		self.tunnel_interface.as_deref()
	}

	/// Uses an already configured tunnel interface instead of bootstrapping.
	pub fn set_tunnel_interface(&mut self, interface: impl Into<String>) {
		self.tunnel_interface = Some(interface.into());
	}

	fn transition(&mut self, next: EngineState) {
		if self.state != next {
			match &next {
				EngineState::Error { reason } => warn!(from = %self.state, %reason, "engine entering error state"),
				_ => info!(from = %self.state, to = %next, "engine state changed"),
			}
		}
		self.state = next;
	}

	fn shutdown_requested(&self) -> bool {
		*self.shutdown.borrow()
	}

	/// Runs the bootstrap and then the sync/watch loop until shutdown.
	/// A failed bootstrap is fatal unless shutdown was requested meanwhile.
	#[instrument(skip_all)]
	pub async fn run<B>(&mut self, bootstrap: &mut B) -> Result<()>
	where
		B: Bootstrap,
	{
		self.transition(EngineState::Bootstrapping);
		match bootstrap.bootstrap(self.shutdown.clone()).await {
			Ok(interface) => {
				info!(%interface, "tunnel bootstrapped");
				self.tunnel_interface = Some(interface);
			}
			Err(e) if self.shutdown_requested() => {
				info!(error = %e, "bootstrap abandoned on shutdown");
				self.transition(EngineState::ShuttingDown);
				return Ok(());
			}
			Err(e) => {
				error!(error = %e, "bootstrap failed");
				return Err(EngineError::Bootstrap(Box::new(e)));
			}
		}
		self.reconcile_until_shutdown().await
	}

	/// The Syncing → Watching → Error loop. Returns once shutdown is
	/// requested.
	pub async fn reconcile_until_shutdown(&mut self) -> Result<()> {
		if self.config.mode == ForwardingMode::Tunnel && self.tunnel_interface.is_none() {
			return Err(EngineError::NoTunnelInterface);
		}

		self.transition(EngineState::Syncing);
		loop {
			if self.shutdown_requested() {
				self.transition(EngineState::ShuttingDown);
				return Ok(());
			}

			let current = self.state.clone();
			let next = match current {
				EngineState::Syncing => match self.subscribe_then_sync().await {
					Ok(report) => {
						info!(
							tracked = report.tracked,
							pruned = report.pruned,
							failed_routes = report.failed_routes,
							"full sync complete"
						);
						EngineState::Watching
					}
					Err(reason) => EngineState::Error { reason },
				},
				EngineState::Watching => EngineState::Error {
					reason: self.watch().await,
				},
				EngineState::Error { .. } => {
					if self.backoff().await {
						EngineState::Syncing
					} else {
						EngineState::ShuttingDown
					}
				}
				EngineState::Bootstrapping | EngineState::ShuttingDown => {
					EngineState::ShuttingDown
				}
			};

			if next == EngineState::ShuttingDown {
				self.transition(next);
				return Ok(());
			}
			// A watch that returned because of shutdown is not an error.
			if self.shutdown_requested() {
				self.transition(EngineState::ShuttingDown);
				return Ok(());
			}
			self.transition(next);
		}
	}

	/// Sleeps for the resync delay. Returns `false` when shutdown interrupted
	/// the wait.
	async fn backoff(&mut self) -> bool {
		debug!(delay = ?self.config.resync_delay, "backing off before resync");
		let mut shutdown = self.shutdown.clone();
		tokio::select! {
			biased;
			_ = shutdown.wait_for(|stop| *stop) => false,
			_ = tokio::time::sleep(self.config.resync_delay) => true,
		}
	}

	/// Opens the event subscription before listing, so notifications raised
	/// while the listing is in flight are queued instead of lost. A held
	/// subscription is kept across failed listings.
	async fn subscribe_then_sync(&mut self) -> std::result::Result<SyncReport, String> {
		if self.events.is_none() {
			let events = self
				.source
				.watch()
				.await
				.map_err(|e| format!("subscribing to network events failed: {e}"))?;
			self.events = Some(events);
		}
		self.sync()
			.await
			.map_err(|e| format!("listing networks failed: {e}"))
	}

	/// Consumes events until the subscription breaks or shutdown is requested,
	/// returning the reason the watch ended.
	async fn watch(&mut self) -> String {
		let mut events = match self.events.take() {
			Some(events) => events,
			None => match self.source.watch().await {
				Ok(events) => events,
				Err(e) => return format!("subscribing to network events failed: {e}"),
			},
		};
		info!("watching network events");

		let mut shutdown = self.shutdown.clone();
		loop {
			let next = tokio::select! {
				biased;
				_ = shutdown.wait_for(|stop| *stop) => return "shutdown requested".to_string(),
				next = events.next() => next,
			};

			match next {
				Some(Ok(event)) => self.apply_event(event).await,
				Some(Err(e)) => return format!("event stream failed: {e}"),
				None => return SourceError::StreamEnded.to_string(),
			}
		}
	}

	/// Lists every network and converges host state onto the listing.
	/// Tracked networks missing from the listing are torn down.
	#[instrument(skip(self))]
	pub async fn sync(&mut self) -> std::result::Result<SyncReport, SourceError> {
		let records = self.source.list().await?;
		let mut report = SyncReport::default();

		let listed: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
		for id in self.registry.ids() {
			if !listed.contains(&id) {
				info!(network_id = %id, "network disappeared while unobserved");
				self.teardown(&id).await;
				report.pruned += 1;
			}
		}

		for record in records {
			report.failed_routes += self.upsert(record).await;
		}
		report.tracked = self.registry.len();
		self.announce_egress().await;
		Ok(report)
	}

	async fn announce_egress(&self) {
		if let Some(observer) = &self.observer {
			observer.egress_changed(&self.registry.egress_bindings()).await;
		}
	}

	/// Handles a single notification. Errors are logged and never stop the
	/// watch.
	#[instrument(skip(self), fields(network_id = %event.id()))]
	pub async fn apply_event(&mut self, event: NetworkEvent) {
		match event {
			NetworkEvent::Created { id } => match self.source.inspect(&id).await {
				Ok(record) => {
					self.upsert(record).await;
				}
				Err(e) if e.is_not_found() => {
					debug!("network vanished before it could be inspected");
				}
				Err(e) => warn!(error = %e, "failed to inspect created network"),
			},
			NetworkEvent::Destroyed { id } => {
				if !self.teardown(&id).await {
					debug!("destroyed network was not tracked");
				}
			}
		}
		self.announce_egress().await;
	}

	fn track(&self, record: NetworkRecord) -> TrackedNetwork {
		let bridge = bridge_interface(&record);
		let route_interface = match (&self.config.mode, &self.tunnel_interface) {
			(ForwardingMode::Tunnel, Some(tunnel)) => tunnel.clone(),
			_ => bridge.clone(),
		};
		TrackedNetwork {
			record,
			route_interface,
			bridge_interface: bridge,
		}
	}

	/// Tracks `record` and installs its routes and rules, removing whatever
	/// the previous version of the same network had that this one lacks.
	/// Returns the number of routes that could not be added.
	async fn upsert(&mut self, record: NetworkRecord) -> usize {
		let network = self.track(record);
		let id = network.record.id.clone();

		if let Some(previous) = self.registry.get(&id).cloned() {
			let keep = network.routes();
			for (cidr, _) in previous.routes() {
				if !keep.iter().any(|(c, _)| *c == cidr) {
					self.delete_route(&id, cidr).await;
				}
			}
			if let Some(policy) = &self.config.firewall {
				let current = policy.rules_for(&network.egress_bindings());
				let failures = policy
					.rules_for(&previous.egress_bindings())
					.without(&current)
					.remove(&self.executor)
					.await;
				if !failures.is_empty() {
					warn!(network_id = %id, failures = failures.len(), "some stale firewall rules were not removed");
				}
			}
		}

		let mut failed = 0;
		for (cidr, interface) in network.routes() {
			match self.executor.add_route(cidr, &interface).await {
				Ok(_) => debug!(network_id = %id, %cidr, %interface, "route added"),
				Err(e) => {
					failed += 1;
					warn!(
						network_id = %id,
						%cidr,
						%interface,
						stderr = e.stderr().unwrap_or_default(),
						error = %e,
						"failed to add route"
					);
				}
			}
		}

		if let Some(policy) = &self.config.firewall {
			let failures = policy
				.rules_for(&network.egress_bindings())
				.apply(&self.executor)
				.await;
			if !failures.is_empty() {
				warn!(network_id = %id, failures = failures.len(), "some firewall rules were not applied");
			}
		}

		if network.routes().is_empty() {
			debug!(network_id = %id, name = %network.record.name, "network has no eligible subnets");
		} else {
			info!(network_id = %id, name = %network.record.name, interface = %network.route_interface, "network reconciled");
		}
		self.registry.upsert(network);
		failed
	}

	/// Removes the routes and rules installed for `id` and forgets it.
	/// Returns `false` when the network was not tracked.
	async fn teardown(&mut self, id: &str) -> bool {
		let Some(network) = self.registry.get(id).cloned() else {
			return false;
		};

		for (cidr, _) in network.routes() {
			self.delete_route(id, cidr).await;
		}
		if let Some(policy) = &self.config.firewall {
			policy
				.rules_for(&network.egress_bindings())
				.remove(&self.executor)
				.await;
		}

		self.registry.remove(id);
		info!(network_id = %id, name = %network.record.name, "network removed");
		true
	}

	async fn delete_route(&self, id: &str, cidr: ipnet::Ipv4Net) {
		match self.executor.delete_route(cidr).await {
			Ok(_) => debug!(network_id = %id, %cidr, "route deleted"),
			Err(e) => warn!(
				network_id = %id,
				%cidr,
				stderr = e.stderr().unwrap_or_default(),
				error = %e,
				"failed to delete route"
			),
		}
	}

	/// Removes the firewall rules of every tracked network. Routes are left to
	/// disappear with the tunnel interface.
	#[instrument(skip(self))]
	pub async fn cleanup(&mut self) {
		self.transition(EngineState::ShuttingDown);
		let Some(policy) = &self.config.firewall else {
			debug!("no firewall policy, nothing to clean up");
			return;
		};

		for network in self.registry.all() {
			let failures = policy
				.rules_for(&network.egress_bindings())
				.remove(&self.executor)
				.await;
			if failures.is_empty() {
				debug!(network_id = %network.record.id, "firewall rules removed");
			}
		}
	}
}
