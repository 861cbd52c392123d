// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory doubles for exercising route and firewall logic without
//! privileges.

use crate::command::{CommandOutput, CommandRunner, RawOutput};
use crate::error::{Result, RuleError};
use crate::executor::{Platform, RuleExecutor};
use crate::firewall::{FirewallRule, RuleOp, Table};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

/// Records every command and simulates enough of `iptables` for `-C`, `-A`,
/// `-I` and `-D` to behave like the real thing. Any other program succeeds
/// unless a failure was scripted for it with [`ScriptedRunner::fail_when`].
#[derive(Default)]
pub struct ScriptedRunner {
	invocations: Mutex<Vec<String>>,
	failures: Mutex<Vec<(String, String)>>,
	chains: Mutex<HashMap<(Table, String), Vec<Vec<String>>>>,
}

impl ScriptedRunner {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fails every command line starting with `prefix`, reporting `stderr`.
	pub fn fail_when(&self, prefix: &str, stderr: &str) {
		self.failures
			.lock()
			.unwrap()
			.push((prefix.to_string(), stderr.to_string()));
	}

	pub fn command_lines(&self) -> Vec<String> {
		self.invocations.lock().unwrap().clone()
	}

	pub fn seed_iptables_rule(&self, table: Table, chain: &str, rule: &[&str]) {
		self.chains
			.lock()
			.unwrap()
			.entry((table, chain.to_string()))
			.or_default()
			.push(rule.iter().map(|s| s.to_string()).collect());
	}

	pub fn iptables_rules(&self, table: Table, chain: &str) -> Vec<Vec<String>> {
		self.chains
			.lock()
			.unwrap()
			.get(&(table, chain.to_string()))
			.cloned()
			.unwrap_or_default()
	}

	fn simulate_iptables(&self, args: &[String]) -> RawOutput {
		let mut table = Table::Filter;
		let mut iter = args.iter().peekable();
		let mut flag = None;
		let mut chain = String::new();

		while let Some(arg) = iter.next() {
			match arg.as_str() {
				"-w" => {}
				"-t" => {
					table = match iter.next().map(String::as_str) {
						Some("nat") => Table::Nat,
						_ => Table::Filter,
					};
				}
				"-C" | "-A" | "-I" | "-D" => {
					flag = Some(arg.clone());
					chain = iter.next().cloned().unwrap_or_default();
					break;
				}
				_ => {}
			}
		}

		let mut position = None;
		if flag.as_deref() == Some("-I") {
			if let Some(pos) = iter.peek().and_then(|p| p.parse::<usize>().ok()) {
				position = Some(pos);
				iter.next();
			}
		}
		let rule: Vec<String> = iter.cloned().collect();

		let mut chains = self.chains.lock().unwrap();
		let rules = chains.entry((table, chain)).or_default();
		let present = rules.iter().position(|r| r == &rule);

		match flag.as_deref() {
			Some("-C") if present.is_some() => RawOutput::ok(""),
			Some("-C") => RawOutput::failed(1, BAD_RULE),
			Some("-A") => {
				rules.push(rule);
				RawOutput::ok("")
			}
			Some("-I") => {
				let index = position.unwrap_or(1).saturating_sub(1).min(rules.len());
				rules.insert(index, rule);
				RawOutput::ok("")
			}
			Some("-D") => match present {
				Some(index) => {
					rules.remove(index);
					RawOutput::ok("")
				}
				None => RawOutput::failed(1, BAD_RULE),
			},
			_ => RawOutput::failed(2, "iptables: unsupported invocation"),
		}
	}
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
	async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
		let line = std::iter::once(program.to_string())
			.chain(args.iter().cloned())
			.collect::<Vec<_>>()
			.join(" ");
		self.invocations.lock().unwrap().push(line.clone());

		let scripted = self
			.failures
			.lock()
			.unwrap()
			.iter()
			.find(|(prefix, _)| line.starts_with(prefix.as_str()))
			.map(|(_, stderr)| stderr.clone());
		if let Some(stderr) = scripted {
			return Ok(RawOutput::failed(1, stderr));
		}

		if program == "iptables" {
			return Ok(self.simulate_iptables(args));
		}
		Ok(RawOutput::ok(""))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
	SetPointToPoint {
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: String,
	},
	AddRoute {
		cidr: Ipv4Net,
		interface: String,
	},
	DeleteRoute {
		cidr: Ipv4Net,
	},
	Firewall {
		rule: FirewallRule,
		op: RuleOp,
	},
}

#[derive(Default)]
struct Recorded {
	calls: Vec<ExecutorCall>,
	routes: BTreeMap<Ipv4Net, String>,
	rules: Vec<FirewallRule>,
	failing_routes: HashSet<Ipv4Net>,
}

/// Executor that keeps an in-memory routing table and rule list and records
/// each primitive call in order.
#[derive(Default)]
pub struct RecordingExecutor {
	state: Mutex<Recorded>,
}

impl RecordingExecutor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes every `add_route` for `cidr` fail.
	pub fn fail_route(&self, cidr: Ipv4Net) {
		self.state.lock().unwrap().failing_routes.insert(cidr);
	}

	pub fn heal_routes(&self) {
		self.state.lock().unwrap().failing_routes.clear();
	}

	pub fn calls(&self) -> Vec<ExecutorCall> {
		self.state.lock().unwrap().calls.clone()
	}

	pub fn clear_calls(&self) {
		self.state.lock().unwrap().calls.clear();
	}

	pub fn routes(&self) -> BTreeMap<Ipv4Net, String> {
		self.state.lock().unwrap().routes.clone()
	}

	pub fn firewall_rules(&self) -> Vec<FirewallRule> {
		self.state.lock().unwrap().rules.clone()
	}

	pub fn added_routes(&self) -> Vec<(Ipv4Net, String)> {
		self.calls()
			.into_iter()
			.filter_map(|call| match call {
				ExecutorCall::AddRoute { cidr, interface } => Some((cidr, interface)),
				_ => None,
			})
			.collect()
	}

	pub fn deleted_routes(&self) -> Vec<Ipv4Net> {
		self.calls()
			.into_iter()
			.filter_map(|call| match call {
				ExecutorCall::DeleteRoute { cidr } => Some(cidr),
				_ => None,
			})
			.collect()
	}
}

#[async_trait]
impl RuleExecutor for RecordingExecutor {
	fn platform(&self) -> Platform {
		Platform::Unix
	}

	async fn set_point_to_point_address(
		&self,
		local: Ipv4Addr,
		peer: Ipv4Addr,
		interface: &str,
	) -> Result<CommandOutput> {
		self.state
			.lock()
			.unwrap()
			.calls
			.push(ExecutorCall::SetPointToPoint {
				local,
				peer,
				interface: interface.to_string(),
			});
		Ok(CommandOutput::default())
	}

	async fn add_route(&self, cidr: Ipv4Net, interface: &str) -> Result<CommandOutput> {
		let mut state = self.state.lock().unwrap();
		state.calls.push(ExecutorCall::AddRoute {
			cidr,
			interface: interface.to_string(),
		});
		if state.failing_routes.contains(&cidr) {
			return Err(RuleError::CommandFailed {
				program: "route".to_string(),
				args: format!("add {cidr}"),
				status: "status 1".to_string(),
				stdout: String::new(),
				stderr: "scripted failure".to_string(),
			});
		}
		state.routes.insert(cidr, interface.to_string());
		Ok(CommandOutput::default())
	}

	async fn delete_route(&self, cidr: Ipv4Net) -> Result<CommandOutput> {
		let mut state = self.state.lock().unwrap();
		state.calls.push(ExecutorCall::DeleteRoute { cidr });
		state.routes.remove(&cidr);
		Ok(CommandOutput::default())
	}

	async fn apply_firewall_rule(&self, rule: &FirewallRule, op: RuleOp) -> Result<CommandOutput> {
		let mut state = self.state.lock().unwrap();
		state.calls.push(ExecutorCall::Firewall {
			rule: rule.clone(),
			op,
		});
		let present = state.rules.iter().position(|r| r == rule);
		match (op, present) {
			(RuleOp::AppendUnique, None) => state.rules.push(rule.clone()),
			(RuleOp::InsertAtHead, None) => state.rules.insert(0, rule.clone()),
			(RuleOp::Delete, Some(i)) | (RuleOp::DeleteIfExists, Some(i)) => {
				state.rules.remove(i);
			}
			(RuleOp::Delete, None) => {
				return Err(RuleError::CommandFailed {
					program: "iptables".to_string(),
					args: rule.to_string(),
					status: "status 1".to_string(),
					stdout: String::new(),
					stderr: BAD_RULE.to_string(),
				})
			}
			_ => {}
		}
		Ok(CommandOutput::default())
	}
}
