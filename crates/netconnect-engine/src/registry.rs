// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::network::NetworkRecord;
use ipnet::Ipv4Net;
use netconnect_rules::EgressBinding;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// A network together with the interfaces resolved for it when it was last
/// observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedNetwork {
	pub record: NetworkRecord,
	/// Interface host routes point at.
	pub route_interface: String,
	/// Bridge behind which the network's containers live.
	pub bridge_interface: String,
}

impl TrackedNetwork {
	pub fn routes(&self) -> Vec<(Ipv4Net, String)> {
		self.record
			.eligible_subnets()
			.into_iter()
			.map(|cidr| (cidr, self.route_interface.clone()))
			.collect()
	}

	pub fn egress_bindings(&self) -> Vec<EgressBinding> {
		self.record
			.eligible_subnets()
			.into_iter()
			.map(|cidr| EgressBinding::new(cidr, self.bridge_interface.clone()))
			.collect()
	}
}

/// Networks currently reflected in host state, keyed by network id.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
	networks: HashMap<String, TrackedNetwork>,
}

impl NetworkRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts or fully replaces the entry for the network's id, returning the
	/// previous one.
	#[instrument(skip(self, network), fields(network_id = %network.record.id))]
	pub fn upsert(&mut self, network: TrackedNetwork) -> Option<TrackedNetwork> {
		let previous = self.networks.insert(network.record.id.clone(), network);
		debug!(replaced = previous.is_some(), "network tracked");
		previous
	}

	pub fn remove(&mut self, id: &str) -> Option<TrackedNetwork> {
		self.networks.remove(id)
	}

	pub fn get(&self, id: &str) -> Option<&TrackedNetwork> {
		self.networks.get(id)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.networks.contains_key(id)
	}

	pub fn all(&self) -> Vec<TrackedNetwork> {
		self.networks.values().cloned().collect()
	}

	/// Every egress binding of every tracked network, in a stable order.
	pub fn egress_bindings(&self) -> Vec<EgressBinding> {
		let mut bindings: Vec<_> = self
			.networks
			.values()
			.flat_map(TrackedNetwork::egress_bindings)
			.collect();
		bindings.sort();
		bindings.dedup();
		bindings
	}

	pub fn ids(&self) -> Vec<String> {
		self.networks.keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.networks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.networks.is_empty()
	}
}
