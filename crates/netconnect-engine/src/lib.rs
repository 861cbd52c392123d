// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation of host routing and firewall state with the container
//! networks living behind the VM.
//!
//! The [`Reconciler`] owns a [`NetworkRegistry`] and drives a
//! [`RuleExecutor`](netconnect_rules::RuleExecutor) so that every eligible
//! subnet reported by a [`NetworkSource`] has a route, and nothing else does.
//! It moves through [`EngineState`]s: a full sync, then watching
//! create/destroy notifications, backing off and syncing again whenever the
//! notification stream breaks.

pub mod docker;
pub mod error;
pub mod interface;
pub mod network;
pub mod reconciler;
pub mod registry;
pub mod source;

pub use docker::DockerSource;
pub use error::{EngineError, Result, SourceError};
pub use interface::{bridge_interface, ForwardingMode, DEFAULT_BRIDGE};
pub use network::{AddressFamily, NetworkRecord, NetworkScope, Subnet, BRIDGE_NAME_OPTION};
pub use reconciler::{
	Bootstrap, EgressObserver, EngineState, Reconciler, ReconcilerConfig, SyncReport,
	DEFAULT_RESYNC_DELAY,
};
pub use registry::{NetworkRegistry, TrackedNetwork};
pub use source::{EventStream, NetworkEvent, NetworkSource};
