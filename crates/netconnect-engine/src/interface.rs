// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Picks the interface a network's traffic is forwarded through.

use crate::network::NetworkRecord;

pub const DEFAULT_BRIDGE: &str = "docker0";
pub const BRIDGE_PREFIX: &str = "br-";
const ID_PREFIX_LEN: usize = 12;

/// Where routes for container subnets point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
	/// Every subnet is routed through the shared tunnel interface.
	Tunnel,
	/// Each network is routed through its own bridge interface.
	PerNetwork,
}

/// Resolves the Linux bridge backing `record`: the explicit bridge name
/// option, then `br-` plus the first twelve characters of the id, then
/// `docker0`.
pub fn bridge_interface(record: &NetworkRecord) -> String {
	if let Some(name) = record.bridge_name() {
		return name.to_string();
	}
	if !record.id.is_empty() {
		let prefix: String = record.id.chars().take(ID_PREFIX_LEN).collect();
		return format!("{BRIDGE_PREFIX}{prefix}");
	}
	DEFAULT_BRIDGE.to_string()
}
