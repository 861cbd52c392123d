// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
	#[error("network {0} not found")]
	NotFound(String),

	#[error("event stream ended")]
	StreamEnded,

	#[error("container runtime error: {0}")]
	Runtime(String),

	#[error("docker error: {0}")]
	Docker(#[from] bollard::errors::Error),
}

impl SourceError {
	pub fn is_not_found(&self) -> bool {
		match self {
			SourceError::NotFound(_) => true,
			SourceError::Docker(bollard::errors::Error::DockerResponseServerError {
				status_code,
				..
			}) => *status_code == 404,
			_ => false,
		}
	}
}

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("bootstrap failed: {0}")]
	Bootstrap(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("tunnel interface unknown, bootstrap has not completed")]
	NoTunnelInterface,

	#[error("network source error: {0}")]
	Source(#[from] SourceError),

	#[error("rule error: {0}")]
	Rule(#[from] netconnect_rules::RuleError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
