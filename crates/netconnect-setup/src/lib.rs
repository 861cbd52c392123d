// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! VM side of the bridge. Runs inside the companion container with the
//! host's network namespace, configures the symmetric tunnel end and lets the
//! host end reach the container subnets through NAT. Later runs in the egress
//! scope only bring the NAT/filter rules in line with the current networks.

pub mod config;
pub mod error;
pub mod setup;
pub mod wireguard;

pub use config::{SetupConfig, SetupScope, DEFAULT_INTERFACE, HOST_ALIAS, KEEPALIVE_SECS};
pub use error::{ConfigError, Result, SetupError};
pub use setup::{apply_egress, run, SetupReport};
pub use wireguard::{resolve_endpoint, VmTunnel};
