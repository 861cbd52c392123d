// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host side of the bridge: brings up the tunnel, hands the VM end its
//! configuration and keeps host routes and VM egress rules in step with
//! container networks.

pub mod bootstrap;
pub mod config;
pub mod daemon;
pub mod egress;
pub mod error;
pub mod remote;
pub mod tunnel;
pub mod userspace;

pub use bootstrap::{TunnelBootstrap, REMOTE_RETRY_DELAY};
pub use config::{Args, DaemonConfig, RouteMode, DEFAULT_SETUP_IMAGE};
pub use daemon::{run, serve, spawn_signal_listener};
pub use egress::CompanionEgress;
pub use error::{BootstrapError, ConfigError, DaemonError, RemoteError, Result, TunnelError};
pub use remote::{CompanionSpec, DockerCompanion, RemoteRunner, COMPANION_NAME};
pub use tunnel::{TunnelConfig, TunnelDevice, TunnelProvider};
pub use userspace::platform_provider;
