// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Declarative NAT and filter rules for container subnets reached through the
//! tunnel.
//!
//! A rule's identity is its full tuple (table, chain, source, destination,
//! interfaces, target). Applying a [`FirewallRuleSet`] twice leaves exactly one
//! copy of every rule; removing it when nothing is installed succeeds.

use crate::error::{Result, RuleError};
use crate::executor::RuleExecutor;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

pub const NAT_CHAIN: &str = "POSTROUTING";
pub const DEFAULT_FILTER_CHAIN: &str = "FORWARD";

/// Egress used when no per-CIDR interface list is available.
pub const LEGACY_EGRESS_WILDCARD: &str = "docker+";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
	Nat,
	Filter,
}

impl Table {
	pub fn as_str(&self) -> &'static str {
		match self {
			Table::Nat => "nat",
			Table::Filter => "filter",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
	Masquerade,
	Accept,
}

impl Target {
	pub fn as_str(&self) -> &'static str {
		match self {
			Target::Masquerade => "MASQUERADE",
			Target::Accept => "ACCEPT",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOp {
	/// Append unless an identical rule is already present.
	AppendUnique,
	/// Insert at position 1 unless an identical rule is already present.
	InsertAtHead,
	Delete,
	DeleteIfExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirewallRule {
	pub table: Table,
	pub chain: String,
	pub source: Ipv4Net,
	pub destination: Ipv4Net,
	pub in_interface: Option<String>,
	pub out_interface: String,
	pub target: Target,
}

impl FirewallRule {
	pub fn masquerade(peer: Ipv4Addr, destination: Ipv4Net, out_interface: &str) -> Self {
		Self {
			table: Table::Nat,
			chain: NAT_CHAIN.to_string(),
			source: host_net(peer),
			destination,
			in_interface: None,
			out_interface: out_interface.to_string(),
			target: Target::Masquerade,
		}
	}

	pub fn accept(
		chain: &str,
		source: Ipv4Addr,
		destination: Ipv4Net,
		in_interface: Option<&str>,
		out_interface: &str,
	) -> Self {
		Self {
			table: Table::Filter,
			chain: chain.to_string(),
			source: host_net(source),
			destination,
			in_interface: in_interface.map(str::to_string),
			out_interface: out_interface.to_string(),
			target: Target::Accept,
		}
	}

	/// Match specification followed by the jump target, without table/chain.
	pub fn match_args(&self) -> Vec<String> {
		let mut args = vec![
			"-s".to_string(),
			self.source.to_string(),
			"-d".to_string(),
			self.destination.to_string(),
		];
		if let Some(in_interface) = &self.in_interface {
			args.push("-i".to_string());
			args.push(in_interface.clone());
		}
		args.push("-o".to_string());
		args.push(self.out_interface.clone());
		args.push("-j".to_string());
		args.push(self.target.as_str().to_string());
		args
	}
}

impl fmt::Display for FirewallRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"-t {} {} {}",
			self.table.as_str(),
			self.chain,
			self.match_args().join(" ")
		)
	}
}

fn host_net(addr: Ipv4Addr) -> Ipv4Net {
	Ipv4Net::from(addr)
}

/// A destination subnet and the interface traffic for it leaves through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EgressBinding {
	pub cidr: Ipv4Net,
	pub interface: String,
}

impl EgressBinding {
	pub fn new(cidr: Ipv4Net, interface: impl Into<String>) -> Self {
		Self {
			cidr,
			interface: interface.into(),
		}
	}

	/// Pairs a comma-separated CIDR list with a comma-separated interface list
	/// by position. Without an interface list every CIDR egresses through
	/// [`LEGACY_EGRESS_WILDCARD`]. Malformed or non-IPv4 entries are logged and
	/// skipped without disturbing the pairing of the remaining ones.
	pub fn parse_list(cidrs: &str, interfaces: Option<&str>) -> Result<Vec<Self>> {
		let cidrs: Vec<&str> = split_list(cidrs);

		let interfaces: Vec<String> = match interfaces.map(split_list) {
			Some(list) if !list.is_empty() => {
				if list.len() != cidrs.len() {
					return Err(RuleError::InvalidBinding(format!(
						"{} CIDRs but {} interfaces",
						cidrs.len(),
						list.len()
					)));
				}
				list.into_iter().map(str::to_string).collect()
			}
			_ => {
				if !cidrs.is_empty() {
					warn!(
						egress = LEGACY_EGRESS_WILDCARD,
						"no per-CIDR interfaces given, falling back to wildcard egress"
					);
				}
				vec![LEGACY_EGRESS_WILDCARD.to_string(); cidrs.len()]
			}
		};

		let mut bindings = Vec::with_capacity(cidrs.len());
		for (cidr, interface) in cidrs.into_iter().zip(interfaces) {
			match cidr.parse::<Ipv4Net>() {
				Ok(net) => bindings.push(EgressBinding::new(net.trunc(), interface)),
				Err(e) => warn!(%cidr, %interface, error = %e, "skipping unusable CIDR"),
			}
		}
		Ok(bindings)
	}
}

fn split_list(raw: &str) -> Vec<&str> {
	raw.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeForward {
	pub address: Ipv4Addr,
	pub interface: String,
}

/// Which rules to derive for each egress binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPolicy {
	/// Tunnel peer whose traffic is masqueraded into the container subnets.
	pub peer_address: Ipv4Addr,
	pub filter: bool,
	pub filter_chain: String,
	pub bridge: Option<BridgeForward>,
}

impl FirewallPolicy {
	pub fn new(peer_address: Ipv4Addr) -> Self {
		Self {
			peer_address,
			filter: false,
			filter_chain: DEFAULT_FILTER_CHAIN.to_string(),
			bridge: None,
		}
	}

	pub fn with_filter(mut self, enabled: bool) -> Self {
		self.filter = enabled;
		self
	}

	pub fn with_bridge(mut self, bridge: Option<BridgeForward>) -> Self {
		self.bridge = bridge;
		self
	}

	pub fn rules_for(&self, bindings: &[EgressBinding]) -> FirewallRuleSet {
		let mut set = FirewallRuleSet::default();
		for binding in bindings {
			set.push(
				FirewallRule::masquerade(self.peer_address, binding.cidr, &binding.interface),
				RuleOp::AppendUnique,
			);
			if self.filter {
				set.push(
					FirewallRule::accept(
						&self.filter_chain,
						self.peer_address,
						binding.cidr,
						None,
						&binding.interface,
					),
					RuleOp::InsertAtHead,
				);
			}
			if let Some(bridge) = &self.bridge {
				set.push(
					FirewallRule::accept(
						&self.filter_chain,
						bridge.address,
						binding.cidr,
						Some(&bridge.interface),
						&binding.interface,
					),
					RuleOp::InsertAtHead,
				);
			}
		}
		set
	}
}

#[derive(Debug, Clone)]
pub struct RuleFailure {
	pub rule: FirewallRule,
	pub error: String,
}

/// Ordered rules with the operation used to install each of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallRuleSet {
	entries: Vec<(FirewallRule, RuleOp)>,
}

impl FirewallRuleSet {
	fn push(&mut self, rule: FirewallRule, op: RuleOp) {
		if !self.entries.iter().any(|(existing, _)| existing == &rule) {
			self.entries.push((rule, op));
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn rules(&self) -> impl Iterator<Item = &FirewallRule> {
		self.entries.iter().map(|(rule, _)| rule)
	}

	/// The rules of this set that `other` does not contain.
	pub fn without(&self, other: &FirewallRuleSet) -> FirewallRuleSet {
		FirewallRuleSet {
			entries: self
				.entries
				.iter()
				.filter(|(rule, _)| !other.rules().any(|r| r == rule))
				.cloned()
				.collect(),
		}
	}

	/// Installs every rule. A failing rule is logged and reported but does not
	/// stop the remaining ones.
	pub async fn apply<E>(&self, executor: &E) -> Vec<RuleFailure>
	where
		E: RuleExecutor + ?Sized,
	{
		let mut failures = Vec::new();
		for (rule, op) in &self.entries {
			match executor.apply_firewall_rule(rule, *op).await {
				Ok(_) => debug!(%rule, "firewall rule applied"),
				Err(e) => {
					warn!(%rule, error = %e, "failed to apply firewall rule");
					failures.push(RuleFailure {
						rule: rule.clone(),
						error: e.to_string(),
					});
				}
			}
		}
		failures
	}

	/// Removes every rule that is present; absent rules are skipped.
	pub async fn remove<E>(&self, executor: &E) -> Vec<RuleFailure>
	where
		E: RuleExecutor + ?Sized,
	{
		let mut failures = Vec::new();
		for (rule, _) in self.entries.iter().rev() {
			match executor
				.apply_firewall_rule(rule, RuleOp::DeleteIfExists)
				.await
			{
				Ok(_) => debug!(%rule, "firewall rule removed"),
				Err(e) => {
					warn!(%rule, error = %e, "failed to remove firewall rule");
					failures.push(RuleFailure {
						rule: rule.clone(),
						error: e.to_string(),
					});
				}
			}
		}
		failures
	}
}
