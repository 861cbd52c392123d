// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::command::{CommandOutput, SystemRunner};
use crate::error::Result;
use crate::firewall::{FirewallRule, RuleOp};
use crate::unix::UnixExecutor;
use crate::windows::WindowsExecutor;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
	Unix,
	Windows,
}

impl std::fmt::Display for Platform {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Platform::Unix => write!(f, "unix"),
			Platform::Windows => write!(f, "windows"),
		}
	}
}

/// Stateless primitives against the local network stack.
///
/// Every primitive is idempotent: re-applying an installed route or rule and
/// removing an absent one both succeed.
#[async_trait]
pub trait RuleExecutor: Send + Sync {
	fn platform(&self) -> Platform;

	/// Configures `interface` with a host-only address and an explicit peer.
	async fn set_point_to_point_address(
		&self,
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: &str,
	) -> Result<CommandOutput>;

	async fn add_route(&self, cidr: Ipv4Net, interface: &str) -> Result<CommandOutput>;

	async fn delete_route(&self, cidr: Ipv4Net) -> Result<CommandOutput>;

	async fn apply_firewall_rule(&self, rule: &FirewallRule, op: RuleOp) -> Result<CommandOutput>;
}

#[async_trait]
impl<T> RuleExecutor for Arc<T>
where
	T: RuleExecutor + ?Sized,
{
	fn platform(&self) -> Platform {
		(**self).platform()
	}

	async fn set_point_to_point_address(
		&self,
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: &str,
	) -> Result<CommandOutput> {
		(**self)
			.set_point_to_point_address(local, peer, interface)
			.await
	}

	async fn add_route(&self, cidr: Ipv4Net, interface: &str) -> Result<CommandOutput> {
		(**self).add_route(cidr, interface).await
	}

	async fn delete_route(&self, cidr: Ipv4Net) -> Result<CommandOutput> {
		(**self).delete_route(cidr).await
	}

	async fn apply_firewall_rule(&self, rule: &FirewallRule, op: RuleOp) -> Result<CommandOutput> {
		(**self).apply_firewall_rule(rule, op).await
	}
}

/// The executor for the platform this binary was built for.
pub fn platform_executor() -> Arc<dyn RuleExecutor> {
	if cfg!(windows) {
		Arc::new(WindowsExecutor::new(SystemRunner))
	} else {
		Arc::new(UnixExecutor::new(SystemRunner))
	}
}
