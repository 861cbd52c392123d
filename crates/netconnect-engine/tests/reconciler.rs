// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod common;

use common::{created, destroyed, local, EgressLog, FakeSource, Step, StubBootstrap};
use ipnet::Ipv4Net;
use netconnect_engine::{
	EngineError, EngineState, ForwardingMode, NetworkRecord, NetworkScope, Reconciler,
	ReconcilerConfig, BRIDGE_NAME_OPTION,
};
use netconnect_rules::testing::{ExecutorCall, RecordingExecutor};
use netconnect_rules::{EgressBinding, FirewallPolicy};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn net(s: &str) -> Ipv4Net {
	s.parse().unwrap()
}

fn config(firewall: Option<FirewallPolicy>) -> ReconcilerConfig {
	ReconcilerConfig {
		mode: ForwardingMode::Tunnel,
		resync_delay: Duration::from_millis(10),
		firewall,
	}
}

fn engine(
	build: impl FnOnce(watch::Sender<bool>) -> FakeSource,
	firewall: Option<FirewallPolicy>,
) -> Reconciler<FakeSource, RecordingExecutor> {
	let (tx, rx) = watch::channel(false);
	Reconciler::new(build(tx), RecordingExecutor::new(), config(firewall), rx)
}

async fn run_to_completion(reconciler: &mut Reconciler<FakeSource, RecordingExecutor>) {
	let mut bootstrap = StubBootstrap::up("utun5");
	tokio::time::timeout(Duration::from_secs(5), reconciler.run(&mut bootstrap))
		.await
		.expect("reconciler did not stop")
		.unwrap();
	assert_eq!(bootstrap.calls, 1);
}

#[tokio::test]
async fn sync_then_destroy_removes_exactly_the_added_route() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx)
				.session(vec![Step::Vanish("n1".to_string()), destroyed("n1")])
		},
		None,
	);
	run_to_completion(&mut r).await;

	assert_eq!(
		r.executor().calls(),
		vec![
			ExecutorCall::AddRoute {
				cidr: net("172.20.0.0/16"),
				interface: "utun5".to_string(),
			},
			ExecutorCall::DeleteRoute {
				cidr: net("172.20.0.0/16"),
			},
		]
	);
	assert!(!r.registry().contains("n1"));
	assert_eq!(r.state(), &EngineState::ShuttingDown);
	assert_eq!(r.source().list_calls(), 2);
}

#[tokio::test]
async fn repeated_sync_converges_to_same_state() {
	let mut r = engine(
		|tx| FakeSource::new(vec![local("n1", "172.20.0.0/16"), local("n2", "172.21.0.0/16")], tx),
		None,
	);
	r.set_tunnel_interface("utun5");

	r.sync().await.unwrap();
	let first = r.executor().routes();
	r.sync().await.unwrap();
	assert_eq!(r.executor().routes(), first);
	assert_eq!(r.registry().len(), 2);

	let expected: BTreeMap<Ipv4Net, String> = [
		(net("172.20.0.0/16"), "utun5".to_string()),
		(net("172.21.0.0/16"), "utun5".to_string()),
	]
	.into_iter()
	.collect();
	assert_eq!(first, expected);
}

#[tokio::test]
async fn duplicate_create_events_are_idempotent() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![], tx).session(vec![
				Step::Appear(local("n2", "172.22.0.0/16")),
				created("n2"),
				created("n2"),
			])
		},
		None,
	);
	run_to_completion(&mut r).await;

	assert_eq!(r.registry().len(), 1);
	assert_eq!(r.executor().routes().len(), 1);
	assert!(r.executor().deleted_routes().is_empty());
}

#[tokio::test]
async fn create_then_destroy_leaves_no_rules_behind() {
	let policy = FirewallPolicy::new(Ipv4Addr::new(10, 33, 33, 1)).with_filter(true);
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![], tx).session(vec![
				Step::Appear(local("abcdef0123456789", "172.23.0.0/16")),
				created("abcdef0123456789"),
				Step::Vanish("abcdef0123456789".to_string()),
				destroyed("abcdef0123456789"),
			])
		},
		Some(policy),
	);
	run_to_completion(&mut r).await;

	assert!(r.executor().routes().is_empty());
	assert!(r.executor().firewall_rules().is_empty());
	assert!(r.registry().is_empty());

	let installed: Vec<_> = r
		.executor()
		.calls()
		.into_iter()
		.filter_map(|call| match call {
			ExecutorCall::Firewall { rule, .. } => Some(rule),
			_ => None,
		})
		.collect();
	assert!(!installed.is_empty());
	assert!(installed
		.iter()
		.all(|rule| rule.out_interface == "br-abcdef012345"));
}

#[tokio::test]
async fn events_apply_in_delivery_order() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![local("n3", "172.24.0.0/16")], tx)
				.session(vec![destroyed("n3"), created("n3")])
		},
		None,
	);
	run_to_completion(&mut r).await;

	// The resync after the stream ends re-adds n3 once more.
	let calls = r.executor().calls();
	assert_eq!(calls.len(), 4);
	assert!(matches!(calls[0], ExecutorCall::AddRoute { .. }));
	assert!(matches!(calls[1], ExecutorCall::DeleteRoute { .. }));
	assert!(matches!(calls[2], ExecutorCall::AddRoute { .. }));
	assert!(r.registry().contains("n3"));
}

#[tokio::test]
async fn only_local_ipv4_networks_get_routes() {
	let records = vec![
		NetworkRecord::new("ov", "overlay", NetworkScope::Other).with_subnet("10.0.9.0/24"),
		NetworkRecord::new("v6", "v6only", NetworkScope::Local).with_subnet("fd00:1::/64"),
		NetworkRecord::new("dual", "dual", NetworkScope::Local)
			.with_subnet("fd00:2::/64")
			.with_subnet("172.25.0.0/16"),
	];
	let mut r = engine(|tx| FakeSource::new(records, tx), None);
	r.set_tunnel_interface("utun5");
	r.sync().await.unwrap();

	assert_eq!(
		r.executor().added_routes(),
		vec![(net("172.25.0.0/16"), "utun5".to_string())]
	);
}

#[tokio::test]
async fn failing_route_does_not_block_others_and_heals_on_next_sync() {
	let mut r = engine(
		|tx| FakeSource::new(vec![local("n1", "172.20.0.0/16"), local("n2", "172.21.0.0/16")], tx),
		None,
	);
	r.set_tunnel_interface("utun5");
	r.executor().fail_route(net("172.20.0.0/16"));

	let report = r.sync().await.unwrap();
	assert_eq!(report.failed_routes, 1);
	assert_eq!(r.executor().routes().len(), 1);
	assert!(r.executor().routes().contains_key(&net("172.21.0.0/16")));

	r.executor().heal_routes();
	let report = r.sync().await.unwrap();
	assert_eq!(report.failed_routes, 0);
	assert_eq!(r.executor().routes().len(), 2);
}

#[tokio::test]
async fn broken_stream_triggers_resync() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx)
				.session(vec![Step::Appear(local("n4", "172.26.0.0/16")), Step::Fail("connection reset".to_string())])
		},
		None,
	);
	run_to_completion(&mut r).await;

	assert_eq!(r.source().list_calls(), 2);
	assert!(r.registry().contains("n4"));
	assert!(r.executor().routes().contains_key(&net("172.26.0.0/16")));
}

#[tokio::test]
async fn resync_prunes_networks_destroyed_while_unobserved() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx)
				.session(vec![Step::Vanish("n1".to_string())])
		},
		None,
	);
	run_to_completion(&mut r).await;

	assert!(r.registry().is_empty());
	assert_eq!(r.executor().deleted_routes(), vec![net("172.20.0.0/16")]);
}

#[tokio::test]
async fn listing_failures_back_off_and_retry() {
	let mut r = engine(
		|tx| FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx).failing_lists(2),
		None,
	);
	run_to_completion(&mut r).await;

	assert_eq!(r.source().list_calls(), 3);
	assert!(r.registry().contains("n1"));
}

#[tokio::test]
async fn destroy_of_unknown_network_changes_nothing() {
	let mut r = engine(|tx| FakeSource::new(vec![], tx).session(vec![destroyed("ghost")]), None);
	run_to_completion(&mut r).await;
	assert!(r.executor().calls().is_empty());
}

#[tokio::test]
async fn bootstrap_failure_is_fatal() {
	let mut r = engine(|tx| FakeSource::new(vec![], tx), None);
	let mut bootstrap = StubBootstrap::failing("utun creation refused");
	let err = r.run(&mut bootstrap).await.unwrap_err();
	assert!(matches!(err, EngineError::Bootstrap(_)));
	assert_eq!(r.source().list_calls(), 0);
}

#[tokio::test]
async fn shutdown_interrupts_backoff_promptly() {
	let (tx, rx) = watch::channel(false);
	let source = FakeSource::new(vec![], tx.clone()).failing_lists(usize::MAX);
	let mut r = Reconciler::new(
		source,
		RecordingExecutor::new(),
		ReconcilerConfig {
			resync_delay: Duration::from_secs(3600),
			..config(None)
		},
		rx,
	);

	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(50)).await;
		let _ = tx.send(true);
	});

	let mut bootstrap = StubBootstrap::up("utun5");
	tokio::time::timeout(Duration::from_secs(5), r.run(&mut bootstrap))
		.await
		.expect("backoff ignored shutdown")
		.unwrap();
	assert_eq!(r.state(), &EngineState::ShuttingDown);
	assert_eq!(r.source().list_calls(), 1);
}

#[tokio::test]
async fn cleanup_removes_firewall_rules_of_tracked_networks() {
	let policy = FirewallPolicy::new(Ipv4Addr::new(10, 33, 33, 1));
	let bridged = local("n5", "172.27.0.0/16").with_option(BRIDGE_NAME_OPTION, "docker0");
	let mut r = engine(|tx| FakeSource::new(vec![bridged], tx), Some(policy));
	r.set_tunnel_interface("utun5");
	r.sync().await.unwrap();

	let rules = r.executor().firewall_rules();
	assert_eq!(rules.len(), 1);
	assert_eq!(rules[0].out_interface, "docker0");

	r.cleanup().await;
	assert!(r.executor().firewall_rules().is_empty());
	assert_eq!(r.state(), &EngineState::ShuttingDown);
}

#[tokio::test]
async fn cleanup_without_firewall_touches_nothing() {
	let mut r = engine(|tx| FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx), None);
	r.set_tunnel_interface("utun5");
	r.sync().await.unwrap();
	r.executor().clear_calls();

	r.cleanup().await;
	assert!(r.executor().calls().is_empty());
}

#[tokio::test]
async fn network_created_while_listing_is_not_missed() {
	let mut r = engine(
		|tx| {
			FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx)
				.arriving_during_list(local("n2", "172.30.0.0/16"))
		},
		None,
	);
	run_to_completion(&mut r).await;

	// The only listing never saw n2; its notification did.
	assert_eq!(r.source().list_calls(), 1);
	assert!(r.registry().contains("n2"));
	assert_eq!(
		r.executor().routes().get(&net("172.30.0.0/16")),
		Some(&"utun5".to_string())
	);
}

#[tokio::test]
async fn malformed_subnet_does_not_block_other_networks() {
	let broken = NetworkRecord::new("bad", "bad", NetworkScope::Local).with_subnet("not-a-cidr");
	let mut r = engine(
		|tx| FakeSource::new(vec![broken, local("n2", "172.21.0.0/16")], tx),
		None,
	);
	r.set_tunnel_interface("utun5");

	let report = r.sync().await.unwrap();
	assert_eq!(report.failed_routes, 0);
	assert_eq!(report.tracked, 2);
	assert_eq!(
		r.executor().added_routes(),
		vec![(net("172.21.0.0/16"), "utun5".to_string())]
	);
}

#[tokio::test]
async fn egress_observer_follows_creates_and_destroys() {
	let log = Arc::new(EgressLog::default());
	let (tx, rx) = watch::channel(false);
	let source = FakeSource::new(vec![local("n1", "172.20.0.0/16")], tx).session(vec![
		Step::Appear(local("n2", "172.30.0.0/16")),
		created("n2"),
		Step::Vanish("n1".to_string()),
		destroyed("n1"),
	]);
	let mut r = Reconciler::new(source, RecordingExecutor::new(), config(None), rx)
		.with_egress_observer(Arc::clone(&log));
	run_to_completion(&mut r).await;

	let seen = log.seen.lock().unwrap().clone();
	let binding = |cidr: &str, id: &str| EgressBinding::new(net(cidr), format!("br-{id}"));
	assert_eq!(seen[0], vec![binding("172.20.0.0/16", "n1")]);
	assert_eq!(
		seen[1],
		vec![binding("172.20.0.0/16", "n1"), binding("172.30.0.0/16", "n2")]
	);
	assert_eq!(seen[2], vec![binding("172.30.0.0/16", "n2")]);
	assert_eq!(log.last(), Some(vec![binding("172.30.0.0/16", "n2")]));
}
