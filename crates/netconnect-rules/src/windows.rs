// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Windows realization through `netsh interface ipv4`.

use crate::command::{args, run_checked, run_tolerant, CommandOutput, CommandRunner};
use crate::error::{Result, RuleError};
use crate::executor::{Platform, RuleExecutor};
use crate::firewall::{FirewallRule, RuleOp};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::instrument;

const NETSH: &str = "netsh";

const ROUTE_EXISTS: &[&str] = &["already exists"];
const ROUTE_ABSENT: &[&str] = &["Element not found", "cannot find"];

pub struct WindowsExecutor<R> {
	runner: R,
}

impl<R> WindowsExecutor<R>
where
	R: CommandRunner,
{
	pub fn new(runner: R) -> Self {
		Self { runner }
	}

	pub fn runner(&self) -> &R {
		&self.runner
	}
}

#[async_trait]
impl<R> RuleExecutor for WindowsExecutor<R>
where
	R: CommandRunner,
{
	fn platform(&self) -> Platform {
		Platform::Windows
	}

	#[instrument(skip(self))]
	async fn set_point_to_point_address(
		&self,
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: &str,
	) -> Result<CommandOutput> {
		let argv = args([
			"interface".to_string(),
			"ipv4".to_string(),
			"set".to_string(),
			"address".to_string(),
			format!("name=\"{interface}\""),
			"static".to_string(),
			local.to_string(),
			"255.255.255.255".to_string(),
			peer.to_string(),
			"gwmetric=100".to_string(),
		]);
		run_checked(&self.runner, NETSH, &argv).await
	}

	#[instrument(skip(self))]
	async fn add_route(&self, cidr: Ipv4Net, interface: &str) -> Result<CommandOutput> {
		let cidr = cidr.to_string();
		let argv = args(["interface", "ipv4", "add", "route", cidr.as_str(), interface]);
		run_tolerant(&self.runner, NETSH, &argv, ROUTE_EXISTS).await
	}

	#[instrument(skip(self))]
	async fn delete_route(&self, cidr: Ipv4Net) -> Result<CommandOutput> {
		let cidr = cidr.to_string();
		let argv = args(["interface", "ipv4", "delete", "route", cidr.as_str()]);
		run_tolerant(&self.runner, NETSH, &argv, ROUTE_ABSENT).await
	}

	async fn apply_firewall_rule(&self, _rule: &FirewallRule, _op: RuleOp) -> Result<CommandOutput> {
		Err(RuleError::Unsupported("firewall rules"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::ScriptedRunner;

	fn net(s: &str) -> Ipv4Net {
		s.parse().unwrap()
	}

	#[tokio::test]
	async fn point_to_point_uses_host_mask_and_peer_gateway() {
		let exec = WindowsExecutor::new(ScriptedRunner::new());
		exec.set_point_to_point_address(
			Ipv4Addr::new(10, 33, 33, 1),
			Ipv4Addr::new(10, 33, 33, 2),
			"wg-bridge",
		)
		.await
		.unwrap();
		assert_eq!(
			exec.runner().command_lines(),
			vec![
				"netsh interface ipv4 set address name=\"wg-bridge\" static 10.33.33.1 255.255.255.255 10.33.33.2 gwmetric=100"
			]
		);
	}

	#[tokio::test]
	async fn interface_name_with_spaces_stays_one_argument() {
		let exec = WindowsExecutor::new(ScriptedRunner::new());
		exec.set_point_to_point_address(
			Ipv4Addr::new(10, 33, 33, 1),
			Ipv4Addr::new(10, 33, 33, 2),
			"Local Area Connection 2",
		)
		.await
		.unwrap();
		let lines = exec.runner().command_lines();
		assert_eq!(lines.len(), 1);
		assert!(lines[0].contains(" name=\"Local Area Connection 2\" static "));
	}

	#[tokio::test]
	async fn existing_route_is_success() {
		let runner = ScriptedRunner::new();
		runner.fail_when(
			"netsh interface ipv4 add route",
			"The object already exists.",
		);
		let exec = WindowsExecutor::new(runner);
		exec.add_route(net("172.18.0.0/16"), "wg-bridge").await.unwrap();
	}

	#[tokio::test]
	async fn missing_route_delete_is_success() {
		let runner = ScriptedRunner::new();
		runner.fail_when("netsh interface ipv4 delete route", "Element not found.");
		let exec = WindowsExecutor::new(runner);
		exec.delete_route(net("172.18.0.0/16")).await.unwrap();
		assert_eq!(
			exec.runner().command_lines(),
			vec!["netsh interface ipv4 delete route 172.18.0.0/16"]
		);
	}

	#[tokio::test]
	async fn other_route_failure_is_reported() {
		let runner = ScriptedRunner::new();
		runner.fail_when("netsh interface ipv4 add route", "The parameter is incorrect.");
		let exec = WindowsExecutor::new(runner);
		let err = exec
			.add_route(net("172.18.0.0/16"), "wg-bridge")
			.await
			.unwrap_err();
		assert_eq!(err.stderr(), Some("The parameter is incorrect."));
	}

	#[tokio::test]
	async fn firewall_rules_are_unsupported() {
		let exec = WindowsExecutor::new(ScriptedRunner::new());
		let rule = FirewallRule::masquerade(
			Ipv4Addr::new(10, 33, 33, 1),
			net("172.17.0.0/16"),
			"docker0",
		);
		let err = exec
			.apply_firewall_rule(&rule, RuleOp::AppendUnique)
			.await
			.unwrap_err();
		assert!(matches!(err, RuleError::Unsupported(_)));
		assert!(exec.runner().command_lines().is_empty());
	}
}
