// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Unix realization: `ifconfig`/`route` on BSD-derived hosts, `ip` on Linux,
//! and `iptables` for NAT/filter rules.

use crate::command::{args, run_checked, run_tolerant, CommandOutput, CommandRunner};
use crate::error::Result;
use crate::executor::{Platform, RuleExecutor};
use crate::firewall::{FirewallRule, RuleOp};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, instrument};

const IPTABLES: &str = "iptables";

const ROUTE_EXISTS: &[&str] = &["File exists"];
const ROUTE_ABSENT: &[&str] = &["not in table", "No such process", "Cannot find"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSyntax {
	/// `ifconfig` + `route` as shipped with macOS and the BSDs.
	Bsd,
	/// iproute2 (`ip addr`, `ip route`).
	Iproute2,
}

impl RouteSyntax {
	pub fn for_host() -> Self {
		if cfg!(target_os = "linux") {
			RouteSyntax::Iproute2
		} else {
			RouteSyntax::Bsd
		}
	}
}

pub struct UnixExecutor<R> {
	runner: R,
	syntax: RouteSyntax,
}

impl<R> UnixExecutor<R>
where
	R: CommandRunner,
{
	pub fn new(runner: R) -> Self {
		Self::with_syntax(runner, RouteSyntax::for_host())
	}

	pub fn with_syntax(runner: R, syntax: RouteSyntax) -> Self {
		Self { runner, syntax }
	}

	pub fn runner(&self) -> &R {
		&self.runner
	}

	fn iptables_args(rule: &FirewallRule, flag: &str, position: Option<&str>) -> Vec<String> {
		let mut out = args(["-w", "-t", rule.table.as_str(), flag, rule.chain.as_str()]);
		if let Some(position) = position {
			out.push(position.to_string());
		}
		out.extend(rule.match_args());
		out
	}

	async fn rule_present(&self, rule: &FirewallRule) -> Result<bool> {
		let check = Self::iptables_args(rule, "-C", None);
		let raw = self
			.runner
			.run(IPTABLES, &check)
			.await
			.map_err(|source| crate::error::RuleError::Spawn {
				program: IPTABLES.to_string(),
				source,
			})?;
		Ok(raw.success)
	}
}

#[async_trait]
impl<R> RuleExecutor for UnixExecutor<R>
where
	R: CommandRunner,
{
	fn platform(&self) -> Platform {
		Platform::Unix
	}

	#[instrument(skip(self))]
	async fn set_point_to_point_address(
		&self,
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: &str,
	) -> Result<CommandOutput> {
		match self.syntax {
			RouteSyntax::Bsd => {
				let argv = args([
					interface.to_string(),
					"inet".to_string(),
					format!("{local}/32"),
					peer.to_string(),
				]);
				run_checked(&self.runner, "ifconfig", &argv).await
			}
			RouteSyntax::Iproute2 => {
				let argv = args([
					"addr".to_string(),
					"add".to_string(),
					format!("{local}/32"),
					"peer".to_string(),
					format!("{peer}/32"),
					"dev".to_string(),
					interface.to_string(),
				]);
				run_tolerant(&self.runner, "ip", &argv, ROUTE_EXISTS).await
			}
		}
	}

	#[instrument(skip(self))]
	async fn add_route(&self, cidr: Ipv4Net, interface: &str) -> Result<CommandOutput> {
		let cidr = cidr.to_string();
		match self.syntax {
			RouteSyntax::Bsd => {
				let argv = args(["-q", "-n", "add", "-inet", cidr.as_str(), "-interface", interface]);
				run_tolerant(&self.runner, "route", &argv, ROUTE_EXISTS).await
			}
			RouteSyntax::Iproute2 => {
				let argv = args(["route", "replace", cidr.as_str(), "dev", interface]);
				run_checked(&self.runner, "ip", &argv).await
			}
		}
	}

	#[instrument(skip(self))]
	async fn delete_route(&self, cidr: Ipv4Net) -> Result<CommandOutput> {
		let cidr = cidr.to_string();
		match self.syntax {
			RouteSyntax::Bsd => {
				let argv = args(["-q", "-n", "delete", "-inet", cidr.as_str()]);
				run_tolerant(&self.runner, "route", &argv, ROUTE_ABSENT).await
			}
			RouteSyntax::Iproute2 => {
				let argv = args(["route", "del", cidr.as_str()]);
				run_tolerant(&self.runner, "ip", &argv, ROUTE_ABSENT).await
			}
		}
	}

	#[instrument(skip(self, rule), fields(rule = %rule))]
	async fn apply_firewall_rule(&self, rule: &FirewallRule, op: RuleOp) -> Result<CommandOutput> {
		match op {
			RuleOp::AppendUnique | RuleOp::InsertAtHead => {
				if self.rule_present(rule).await? {
					debug!("rule already present");
					return Ok(CommandOutput::default());
				}
				let argv = if op == RuleOp::AppendUnique {
					Self::iptables_args(rule, "-A", None)
				} else {
					Self::iptables_args(rule, "-I", Some("1"))
				};
				run_checked(&self.runner, IPTABLES, &argv).await
			}
			RuleOp::Delete => {
				run_checked(&self.runner, IPTABLES, &Self::iptables_args(rule, "-D", None)).await
			}
			RuleOp::DeleteIfExists => {
				if !self.rule_present(rule).await? {
					debug!("rule already absent");
					return Ok(CommandOutput::default());
				}
				run_checked(&self.runner, IPTABLES, &Self::iptables_args(rule, "-D", None)).await
			}
		}
	}
}
