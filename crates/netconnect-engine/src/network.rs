// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::{IpNet, Ipv4Net};
use std::collections::HashMap;
use std::fmt;

/// Driver option carrying an explicit Linux bridge name.
pub const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkScope {
	Local,
	Other,
}

impl NetworkScope {
	pub fn parse(raw: &str) -> Self {
		if raw.eq_ignore_ascii_case("local") {
			NetworkScope::Local
		} else {
			NetworkScope::Other
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
	V4,
	V6,
}

/// A subnet as reported by the runtime. The CIDR text is kept verbatim so
/// malformed entries can still be logged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subnet {
	pub cidr: String,
	pub family: AddressFamily,
}

impl Subnet {
	pub fn new(cidr: impl Into<String>) -> Self {
		let cidr = cidr.into();
		let family = if cidr.contains(':') {
			AddressFamily::V6
		} else {
			AddressFamily::V4
		};
		Self { cidr, family }
	}

	/// The subnet as a truncated IPv4 network, or `None` for IPv6 and
	/// unparsable entries.
	pub fn ipv4(&self) -> Option<Ipv4Net> {
		if self.family != AddressFamily::V4 {
			return None;
		}
		match self.cidr.parse::<IpNet>().ok()? {
			IpNet::V4(net) => Some(net.trunc()),
			IpNet::V6(_) => None,
		}
	}
}

impl fmt::Display for Subnet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.cidr)
	}
}

/// Last known definition of one container network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
	pub id: String,
	pub name: String,
	pub scope: NetworkScope,
	pub subnets: Vec<Subnet>,
	pub options: HashMap<String, String>,
}

impl NetworkRecord {
	pub fn new(id: impl Into<String>, name: impl Into<String>, scope: NetworkScope) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			scope,
			subnets: Vec::new(),
			options: HashMap::new(),
		}
	}

	pub fn with_subnet(mut self, cidr: impl Into<String>) -> Self {
		self.subnets.push(Subnet::new(cidr));
		self
	}

	pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.options.insert(key.into(), value.into());
		self
	}

	pub fn bridge_name(&self) -> Option<&str> {
		self.options
			.get(BRIDGE_NAME_OPTION)
			.map(String::as_str)
			.filter(|name| !name.is_empty())
	}

	/// IPv4 subnets that get a host route. Networks that are not local in
	/// scope have none.
	pub fn eligible_subnets(&self) -> Vec<Ipv4Net> {
		if self.scope != NetworkScope::Local {
			return Vec::new();
		}
		let mut nets: Vec<Ipv4Net> = Vec::new();
		for subnet in &self.subnets {
			if let Some(net) = subnet.ipv4() {
				if !nets.contains(&net) {
					nets.push(net);
				}
			}
		}
		nets
	}
}
