// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::SetupConfig;
use crate::error::Result;
use crate::wireguard::VmTunnel;
use netconnect_rules::{CommandRunner, RuleExecutor, RuleFailure};
use std::net::SocketAddr;
use tracing::{info, instrument, warn};

#[derive(Debug, Default)]
pub struct SetupReport {
	pub rules_applied: usize,
	pub rules_removed: usize,
	pub failed_rules: Vec<RuleFailure>,
}

/// Brings the VM end up and installs NAT/filter rules for every container
/// subnet. Link errors are fatal; a rule that cannot be installed is reported
/// and the rest still go in.
#[instrument(skip_all, fields(subnets = config.egress.len()))]
pub async fn run<R>(config: &SetupConfig, tunnel: &VmTunnel<R>, endpoint: SocketAddr) -> Result<SetupReport>
where
	R: CommandRunner,
{
	tunnel.bring_up(config, endpoint).await?;
	Ok(apply_egress(config, tunnel.executor()).await)
}

/// Removes the rules only stale bindings needed, then installs the rules of
/// the current bindings. Rules shared by both sets stay in place.
#[instrument(skip_all, fields(subnets = config.egress.len(), stale = config.stale.len()))]
pub async fn apply_egress<E>(config: &SetupConfig, executor: &E) -> SetupReport
where
	E: RuleExecutor + ?Sized,
{
	let policy = config.firewall_policy();
	let rules = policy.rules_for(&config.egress);
	let stale = policy.rules_for(&config.stale).without(&rules);

	let mut failed_rules = stale.remove(executor).await;
	let rules_removed = stale.len() - failed_rules.len();
	for failure in &failed_rules {
		warn!(rule = %failure.rule, error = %failure.error, "stale rule not removed");
	}

	let failed_installs = rules.apply(executor).await;
	for failure in &failed_installs {
		warn!(rule = %failure.rule, error = %failure.error, "rule not installed");
	}

	let report = SetupReport {
		rules_applied: rules.len() - failed_installs.len(),
		rules_removed,
		failed_rules: {
			failed_rules.extend(failed_installs);
			failed_rules
		},
	};
	info!(
		applied = report.rules_applied,
		removed = report.rules_removed,
		failed = report.failed_rules.len(),
		"egress rules reconciled"
	);
	report
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::tests::load;
	use netconnect_rules::testing::ScriptedRunner;
	use netconnect_rules::{Table, DEFAULT_FILTER_CHAIN, NAT_CHAIN};

	fn endpoint() -> SocketAddr {
		"192.168.65.254:3333".parse().unwrap()
	}

	#[tokio::test]
	async fn installs_masquerade_per_subnet() {
		let config = load(&[
			("DOCKER_CIDRS", "172.17.0.0/16,172.20.0.0/16"),
			("DOCKER_INTERFACES", "docker0,br-0123456789ab"),
		])
		.unwrap();
		let tunnel = VmTunnel::new(ScriptedRunner::new());

		let report = run(&config, &tunnel, endpoint()).await.unwrap();
		assert_eq!(report.rules_applied, 2);
		assert!(report.failed_rules.is_empty());

		let nat = tunnel.executor().runner().iptables_rules(Table::Nat, NAT_CHAIN);
		assert_eq!(nat.len(), 2);
		assert_eq!(
			nat[0].join(" "),
			"-s 10.33.33.1/32 -d 172.17.0.0/16 -o docker0 -j MASQUERADE"
		);
		assert!(nat[1].join(" ").contains("br-0123456789ab"));
		assert!(tunnel
			.executor()
			.runner()
			.iptables_rules(Table::Filter, DEFAULT_FILTER_CHAIN)
			.is_empty());
	}

	#[tokio::test]
	async fn rerun_does_not_duplicate_rules() {
		let config = load(&[
			("DOCKER_CIDRS", "172.20.0.0/16"),
			("DOCKER_INTERFACES", "br-0123456789ab"),
			("ENABLE_DOCKER_FILTER", "true"),
			("BRIDGE_IP", "192.168.65.1"),
			("BRIDGE_INTERFACE", "eth0"),
		])
		.unwrap();
		let tunnel = VmTunnel::new(ScriptedRunner::new());

		run(&config, &tunnel, endpoint()).await.unwrap();
		run(&config, &tunnel, endpoint()).await.unwrap();

		let runner = tunnel.executor().runner();
		assert_eq!(runner.iptables_rules(Table::Nat, NAT_CHAIN).len(), 1);
		let filter = runner.iptables_rules(Table::Filter, DEFAULT_FILTER_CHAIN);
		assert_eq!(filter.len(), 2);
		// Accept rules go to the head of the chain, so the bridge rule lands first.
		assert!(filter[0].join(" ").contains("192.168.65.1"));
		assert!(filter[1].join(" ").contains("10.33.33.1"));
	}

	#[tokio::test]
	async fn legacy_wildcard_egress_without_interfaces() {
		let config = load(&[("DOCKER_CIDRS", "172.17.0.0/16")]).unwrap();
		let tunnel = VmTunnel::new(ScriptedRunner::new());

		run(&config, &tunnel, endpoint()).await.unwrap();
		let nat = tunnel.executor().runner().iptables_rules(Table::Nat, NAT_CHAIN);
		assert!(nat[0].join(" ").contains("docker+"));
	}

	#[tokio::test]
	async fn egress_refresh_leaves_link_alone_and_drops_stale_rules() {
		let tunnel = VmTunnel::new(ScriptedRunner::new());
		let first = load(&[
			("DOCKER_CIDRS", "172.17.0.0/16,172.30.0.0/16"),
			("DOCKER_INTERFACES", "docker0,br-0123456789ab"),
			("ENABLE_DOCKER_FILTER", "true"),
		])
		.unwrap();
		run(&first, &tunnel, endpoint()).await.unwrap();
		let runner = tunnel.executor().runner();
		let commands_before = runner.command_lines().len();

		let refresh = load(&[
			("SETUP_SCOPE", "egress"),
			("DOCKER_CIDRS", "172.17.0.0/16"),
			("DOCKER_INTERFACES", "docker0"),
			("STALE_CIDRS", "172.30.0.0/16"),
			("STALE_INTERFACES", "br-0123456789ab"),
			("ENABLE_DOCKER_FILTER", "true"),
		])
		.unwrap();
		let report = apply_egress(&refresh, tunnel.executor()).await;
		assert_eq!(report.rules_removed, 2);
		assert!(report.failed_rules.is_empty());

		let nat = runner.iptables_rules(Table::Nat, NAT_CHAIN);
		assert_eq!(nat.len(), 1);
		assert!(nat[0].join(" ").contains("172.17.0.0/16"));
		let filter = runner.iptables_rules(Table::Filter, DEFAULT_FILTER_CHAIN);
		assert_eq!(filter.len(), 1);
		assert!(!filter[0].join(" ").contains("172.30.0.0/16"));

		let refresh_commands = &runner.command_lines()[commands_before..];
		assert!(refresh_commands.iter().all(|line| line.starts_with("iptables")));
	}

	#[tokio::test]
	async fn failing_rule_does_not_stop_the_others() {
		let config = load(&[
			("DOCKER_CIDRS", "172.17.0.0/16,172.20.0.0/16"),
			("DOCKER_INTERFACES", "docker0,br-0123456789ab"),
		])
		.unwrap();
		let tunnel = VmTunnel::new(ScriptedRunner::new());
		tunnel.executor().runner().fail_when(
			"iptables -w -t nat -A POSTROUTING -s 10.33.33.1/32 -d 172.17.0.0/16",
			"iptables: No chain/target/match by that name.",
		);

		let report = run(&config, &tunnel, endpoint()).await.unwrap();
		assert_eq!(report.rules_applied, 1);
		assert_eq!(report.failed_rules.len(), 1);
		let nat = tunnel.executor().runner().iptables_rules(Table::Nat, NAT_CHAIN);
		assert_eq!(nat.len(), 1);
		assert!(nat[0].join(" ").contains("172.20.0.0/16"));
	}
}
