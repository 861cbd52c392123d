// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
	#[error("failed to create tunnel device {name}: {reason}")]
	Create { name: String, reason: String },

	#[error("control socket for {0} did not appear")]
	SocketMissing(String),

	#[error("control socket I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("device rejected configuration with errno {0}")]
	Rejected(i32),

	#[error("malformed control socket response: {0}")]
	Protocol(String),

	#[error("userspace tunnels are not supported on this platform")]
	Unsupported,
}

#[derive(Debug, Error)]
pub enum RemoteError {
	#[error("docker error: {0}")]
	Docker(#[from] bollard::errors::Error),

	#[error("companion container exited with status {0}")]
	ExitStatus(i64),

	#[error("companion container ended without reporting a status")]
	NoStatus,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
	#[error("tunnel error: {0}")]
	Tunnel(#[from] TunnelError),

	#[error("key error: {0}")]
	Key(#[from] netconnect_common::KeyError),

	#[error("failed to configure tunnel addressing: {0}")]
	Address(#[from] netconnect_rules::RuleError),

	#[error("shutdown requested before the remote side was set up")]
	Shutdown,
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("BRIDGE_IP and BRIDGE_INTERFACE must be set together")]
	IncompleteBridge,

	#[error("parse error: {0}")]
	Parse(String),
}

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("engine error: {0}")]
	Engine(#[from] netconnect_engine::EngineError),

	#[error("network source error: {0}")]
	Source(#[from] netconnect_engine::SourceError),

	#[error("signal handler error: {0}")]
	Signal(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
