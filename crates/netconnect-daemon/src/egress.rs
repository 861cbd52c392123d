// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keeps the VM's NAT/filter rules in step with the container networks once
//! the tunnel is up, by re-running the companion in its egress-only scope.

use crate::remote::{CompanionSpec, RemoteRunner};
use async_trait::async_trait;
use netconnect_engine::EgressObserver;
use netconnect_rules::EgressBinding;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const SCOPE_ENV: &str = "SETUP_SCOPE";
pub const EGRESS_SCOPE: &str = "egress";

/// Adds the current bindings and, when some went away, the stale ones.
pub fn with_bindings(
	spec: CompanionSpec,
	current: &[EgressBinding],
	stale: &[EgressBinding],
) -> CompanionSpec {
	let (cidrs, interfaces) = join(current);
	let mut spec = spec
		.env("DOCKER_CIDRS", cidrs)
		.env("DOCKER_INTERFACES", interfaces);
	if !stale.is_empty() {
		let (cidrs, interfaces) = join(stale);
		spec = spec
			.env("STALE_CIDRS", cidrs)
			.env("STALE_INTERFACES", interfaces);
	}
	spec
}

fn join(bindings: &[EgressBinding]) -> (String, String) {
	let cidrs: Vec<_> = bindings.iter().map(|b| b.cidr.to_string()).collect();
	let interfaces: Vec<_> = bindings.iter().map(|b| b.interface.as_str()).collect();
	(cidrs.join(","), interfaces.join(","))
}

#[derive(Default)]
struct Pushed {
	/// Companion environment without any binding lists.
	base: Option<CompanionSpec>,
	/// Bindings the VM was last confirmed to have rules for.
	bindings: Vec<EgressBinding>,
}

/// Shared between the bootstrap, which records what the first companion run
/// installed, and the engine, which reports every later binding set.
pub struct CompanionEgress<R> {
	remote: Arc<R>,
	pushed: Mutex<Pushed>,
}

impl<R> CompanionEgress<R>
where
	R: RemoteRunner,
{
	pub fn new(remote: Arc<R>) -> Self {
		Self {
			remote,
			pushed: Mutex::new(Pushed::default()),
		}
	}

	pub fn remote(&self) -> &R {
		&self.remote
	}

	/// Records a successful full companion run.
	pub async fn installed(&self, base: CompanionSpec, bindings: Vec<EgressBinding>) {
		let mut pushed = self.pushed.lock().await;
		pushed.base = Some(base);
		pushed.bindings = bindings;
	}

	pub async fn pushed(&self) -> Vec<EgressBinding> {
		self.pushed.lock().await.bindings.clone()
	}
}

#[async_trait]
impl<R> EgressObserver for CompanionEgress<R>
where
	R: RemoteRunner,
{
	#[instrument(skip_all, fields(bindings = bindings.len()))]
	async fn egress_changed(&self, bindings: &[EgressBinding]) {
		let mut pushed = self.pushed.lock().await;
		let Some(base) = pushed.base.clone() else {
			debug!("companion has not run yet");
			return;
		};
		if pushed.bindings == bindings {
			return;
		}

		let stale: Vec<_> = pushed
			.bindings
			.iter()
			.filter(|b| !bindings.contains(*b))
			.cloned()
			.collect();
		let spec = with_bindings(base.env(SCOPE_ENV, EGRESS_SCOPE), bindings, &stale);
		match self.remote.run_to_completion(&spec).await {
			Ok(()) => {
				info!(stale = stale.len(), "VM egress rules refreshed");
				pushed.bindings = bindings.to_vec();
			}
			Err(e) => warn!(error = %e, "failed to refresh VM egress rules, retrying on the next change"),
		}
	}
}
