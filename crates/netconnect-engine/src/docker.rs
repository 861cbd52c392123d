// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! [`NetworkSource`] over the Docker Engine API.

use crate::error::SourceError;
use crate::network::{NetworkRecord, NetworkScope, Subnet};
use crate::source::{EventStream, NetworkEvent, NetworkSource};
use async_trait::async_trait;
use bollard::models::{EventMessage, EventMessageTypeEnum, Network};
use bollard::network::{InspectNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct DockerSource {
	docker: Docker,
}

impl DockerSource {
	pub fn new(docker: Docker) -> Self {
		Self { docker }
	}

	pub fn connect() -> Result<Self, SourceError> {
		let docker = Docker::connect_with_local_defaults()?;
		Ok(Self::new(docker))
	}

	pub fn client(&self) -> &Docker {
		&self.docker
	}
}

/// Converts the runtime's network description into a record. Entries
/// without an id cannot be tracked and yield `None`.
pub fn record_from_network(network: Network) -> Option<NetworkRecord> {
	let id = network.id.filter(|id| !id.is_empty())?;
	let subnets = network
		.ipam
		.and_then(|ipam| ipam.config)
		.unwrap_or_default()
		.into_iter()
		.filter_map(|config| config.subnet)
		.filter(|subnet| !subnet.is_empty())
		.map(Subnet::new)
		.collect();

	Some(NetworkRecord {
		id,
		name: network.name.unwrap_or_default(),
		scope: NetworkScope::parse(network.scope.as_deref().unwrap_or_default()),
		subnets,
		options: network.options.unwrap_or_default(),
	})
}

/// Unix timestamp handed to the events endpoint as `since`. The event
/// connection is opened by a background task, so anything the runtime
/// reports after `watch` returned is replayed even if the task connects late.
fn since_now() -> String {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs())
		.unwrap_or_default()
		.to_string()
}

/// Maps a runtime event onto a network create/destroy notification.
pub fn event_from_message(message: EventMessage) -> Option<NetworkEvent> {
	if message.typ != Some(EventMessageTypeEnum::NETWORK) {
		return None;
	}
	let id = message.actor.and_then(|actor| actor.id)?;
	match message.action.as_deref() {
		Some("create") => Some(NetworkEvent::Created { id }),
		Some("destroy") => Some(NetworkEvent::Destroyed { id }),
		_ => None,
	}
}

#[async_trait]
impl NetworkSource for DockerSource {
	#[instrument(skip(self))]
	async fn list(&self) -> Result<Vec<NetworkRecord>, SourceError> {
		let networks = self
			.docker
			.list_networks(None::<ListNetworksOptions<String>>)
			.await?;
		debug!(count = networks.len(), "listed networks");
		Ok(networks.into_iter().filter_map(record_from_network).collect())
	}

	#[instrument(skip(self))]
	async fn inspect(&self, id: &str) -> Result<NetworkRecord, SourceError> {
		let network = self
			.docker
			.inspect_network(id, None::<InspectNetworkOptions<String>>)
			.await?;
		record_from_network(network).ok_or_else(|| SourceError::NotFound(id.to_string()))
	}

	async fn watch(&self) -> Result<EventStream, SourceError> {
		let mut filters = HashMap::new();
		filters.insert("type".to_string(), vec!["network".to_string()]);
		filters.insert(
			"event".to_string(),
			vec!["create".to_string(), "destroy".to_string()],
		);

		let docker = self.docker.clone();
		let since = since_now();
		debug!(%since, "subscribing to network events");
		let (tx, rx) = mpsc::channel(EVENT_BUFFER);

		tokio::spawn(async move {
			let mut events = docker.events(Some(EventsOptions::<String> {
				since: Some(since),
				filters,
				..Default::default()
			}));
			while let Some(item) = events.next().await {
				let forwarded = match item {
					Ok(message) => match event_from_message(message) {
						Some(event) => Ok(event),
						None => {
							trace!("ignoring unrelated runtime event");
							continue;
						}
					},
					Err(e) => Err(SourceError::from(e)),
				};
				let failed = forwarded.is_err();
				if tx.send(forwarded).await.is_err() || failed {
					return;
				}
			}
			warn!("docker event stream closed");
			let _ = tx.send(Err(SourceError::StreamEnded)).await;
		});

		Ok(futures::stream::unfold(rx, |mut rx| async move {
			rx.recv().await.map(|item| (item, rx))
		})
		.boxed())
	}
}
