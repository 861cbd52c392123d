// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::bootstrap::TunnelBootstrap;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::remote::{DockerCompanion, RemoteRunner};
use crate::userspace::platform_provider;
use netconnect_engine::{DockerSource, NetworkSource, Reconciler, ReconcilerConfig};
use netconnect_rules::{platform_executor, RuleExecutor};
use tokio::sync::watch;
use tracing::{error, info, instrument};

/// Runs the engine to completion and then releases what it acquired, whether
/// it stopped on a signal or on a fatal error.
pub async fn serve<S, E, X, R, T>(
	reconciler: &mut Reconciler<S, E>,
	bootstrap: &mut TunnelBootstrap<X, R, T>,
) -> Result<()>
where
	S: NetworkSource,
	E: RuleExecutor,
	X: RuleExecutor,
	R: RemoteRunner,
	T: NetworkSource,
{
	let outcome = reconciler.run(bootstrap).await;
	if let Err(e) = &outcome {
		error!(error = %e, "engine stopped");
	}

	reconciler.cleanup().await;
	bootstrap.teardown().await;
	outcome.map_err(DaemonError::from)
}

/// Flips `shutdown` on the first interrupt or termination signal.
pub fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
	tokio::spawn(async move {
		match wait_for_signal().await {
			Ok(()) => info!("shutdown signal received"),
			Err(e) => error!(error = %DaemonError::Signal(e), "signal handling unavailable, shutting down"),
		}
		let _ = shutdown.send(true);
	});
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut terminate = signal(SignalKind::terminate())?;
	tokio::select! {
		result = tokio::signal::ctrl_c() => result,
		_ = terminate.recv() => Ok(()),
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
	tokio::signal::ctrl_c().await
}

#[instrument(skip_all, fields(interface = %config.interface_name))]
pub async fn run(config: DaemonConfig) -> Result<()> {
	let source = DockerSource::connect()?;
	let executor = platform_executor();
	info!(platform = %executor.platform(), "starting network bridge");

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	spawn_signal_listener(shutdown_tx);

	let engine_config = ReconcilerConfig {
		mode: config.forwarding,
		resync_delay: config.resync_delay,
		firewall: config.firewall_policy(),
	};
	let remote = DockerCompanion::new(source.client().clone());
	let mut bootstrap = TunnelBootstrap::new(
		config,
		platform_provider(),
		executor.clone(),
		remote,
		source.clone(),
	);
	let mut reconciler = Reconciler::new(source, executor, engine_config, shutdown_rx)
		.with_egress_observer(bootstrap.egress());

	serve(&mut reconciler, &mut bootstrap).await?;
	info!("network bridge stopped");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bootstrap::tests::{config, DeviceLog, FakeProvider, FakeRemote, ListedNetworks};
	use netconnect_engine::{EngineError, EngineState, NetworkRecord, NetworkScope};
	use netconnect_rules::testing::RecordingExecutor;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Duration;

	fn parts(
		config: DaemonConfig,
		remote: FakeRemote,
		arrivals: Vec<NetworkRecord>,
		shutdown: watch::Receiver<bool>,
	) -> (
		Reconciler<ListedNetworks, Arc<RecordingExecutor>>,
		TunnelBootstrap<Arc<RecordingExecutor>, FakeRemote, ListedNetworks>,
		Arc<DeviceLog>,
		Arc<RecordingExecutor>,
	) {
		let log = Arc::new(DeviceLog::default());
		let executor = Arc::new(RecordingExecutor::new());
		let engine_config = ReconcilerConfig {
			mode: config.forwarding,
			resync_delay: Duration::from_millis(5),
			firewall: config.firewall_policy(),
		};
		let networks = vec![NetworkRecord::new("0123456789abcdef", "n1", NetworkScope::Local)
			.with_subnet("172.20.0.0/16")];
		let bootstrap = TunnelBootstrap::new(
			config,
			Box::new(FakeProvider {
				log: Arc::clone(&log),
			}),
			Arc::clone(&executor),
			remote,
			ListedNetworks::new(networks.clone()),
		)
		.with_retry_delay(Duration::from_millis(5));
		let reconciler = Reconciler::new(
			ListedNetworks::new(networks).arriving(arrivals),
			Arc::clone(&executor),
			engine_config,
			shutdown,
		)
		.with_egress_observer(bootstrap.egress());
		(reconciler, bootstrap, log, executor)
	}

	#[tokio::test]
	async fn shutdown_removes_firewall_rules_and_tunnel() {
		let (tx, rx) = watch::channel(false);
		let (mut reconciler, mut bootstrap, log, executor) = parts(
			config(&["--enable-host-firewall"]),
			FakeRemote::default(),
			vec![],
			rx,
		);

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			let _ = tx.send(true);
		});
		let outcome = tokio::time::timeout(
			Duration::from_secs(5),
			serve(&mut reconciler, &mut bootstrap),
		)
		.await
		.unwrap();

		assert!(outcome.is_ok());
		assert_eq!(*reconciler.state(), EngineState::ShuttingDown);
		assert_eq!(log.closed.load(Ordering::SeqCst), 1);
		assert!(executor.firewall_rules().is_empty());
		assert!(executor
			.routes()
			.contains_key(&"172.20.0.0/16".parse().unwrap()));
	}

	#[tokio::test]
	async fn failed_bootstrap_is_reported_after_teardown() {
		let (_tx, rx) = watch::channel(false);
		let (mut reconciler, mut bootstrap, log, _) = parts(
			config(&["--host-private-key", "%%%"]),
			FakeRemote::default(),
			vec![],
			rx,
		);

		let outcome = serve(&mut reconciler, &mut bootstrap).await;
		assert!(matches!(
			outcome,
			Err(DaemonError::Engine(EngineError::Bootstrap(_)))
		));
		assert_eq!(log.closed.load(Ordering::SeqCst), 1);
		assert_eq!(bootstrap.interface(), None);
	}

	#[tokio::test]
	async fn shutdown_during_remote_retries_exits_cleanly() {
		let (tx, rx) = watch::channel(false);
		let remote = FakeRemote {
			failures: AtomicUsize::new(usize::MAX),
			..Default::default()
		};
		let (mut reconciler, mut bootstrap, log, _) = parts(config(&[]), remote, vec![], rx);

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(30)).await;
			let _ = tx.send(true);
		});
		let outcome = tokio::time::timeout(
			Duration::from_secs(5),
			serve(&mut reconciler, &mut bootstrap),
		)
		.await
		.unwrap();

		assert!(outcome.is_ok());
		assert!(reconciler.registry().is_empty());
		assert_eq!(log.closed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn network_created_after_bootstrap_reaches_vm_rules() {
		let (tx, rx) = watch::channel(false);
		let late = NetworkRecord::new("fedcba9876543210", "n2", NetworkScope::Local)
			.with_subnet("172.30.0.0/16");
		let (mut reconciler, mut bootstrap, _, executor) = parts(
			config(&["--enable-docker-filter"]),
			FakeRemote::default(),
			vec![late],
			rx,
		);

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(100)).await;
			let _ = tx.send(true);
		});
		let outcome = tokio::time::timeout(
			Duration::from_secs(5),
			serve(&mut reconciler, &mut bootstrap),
		)
		.await
		.unwrap();
		assert!(outcome.is_ok());
		assert!(executor
			.routes()
			.contains_key(&"172.30.0.0/16".parse().unwrap()));

		let runs = bootstrap.remote().runs.lock().unwrap();
		assert_eq!(runs.len(), 2);
		assert_eq!(runs[0].get("DOCKER_CIDRS"), Some("172.20.0.0/16"));
		let refresh = &runs[1];
		assert_eq!(refresh.get("SETUP_SCOPE"), Some("egress"));
		assert_eq!(refresh.get("DOCKER_CIDRS"), Some("172.20.0.0/16,172.30.0.0/16"));
		assert_eq!(
			refresh.get("DOCKER_INTERFACES"),
			Some("br-0123456789ab,br-fedcba987654")
		);
		assert_eq!(refresh.get("ENABLE_DOCKER_FILTER"), Some("true"));
		assert_eq!(refresh.get("STALE_CIDRS"), None);
	}
}
