// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Route and firewall primitives shared by the host daemon and the VM-side
//! setup program.
//!
//! Everything that touches the kernel goes through [`RuleExecutor`], which is
//! realized per platform by [`UnixExecutor`] and [`WindowsExecutor`]. Both
//! shell out through a [`CommandRunner`] so the exact command lines can be
//! asserted in tests.

pub mod command;
pub mod error;
pub mod executor;
pub mod firewall;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod unix;
pub mod windows;

pub use command::{CommandOutput, CommandRunner, RawOutput, SystemRunner};
pub use error::{Result, RuleError};
pub use executor::{platform_executor, Platform, RuleExecutor};
pub use firewall::{
	BridgeForward, EgressBinding, FirewallPolicy, FirewallRule, FirewallRuleSet, RuleFailure,
	RuleOp, Table, Target, DEFAULT_FILTER_CHAIN, LEGACY_EGRESS_WILDCARD, NAT_CHAIN,
};
pub use unix::{RouteSyntax, UnixExecutor};
pub use windows::WindowsExecutor;
