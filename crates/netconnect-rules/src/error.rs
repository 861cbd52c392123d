// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
	#[error("failed to execute {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{program} {args} exited with {status}: {stderr}")]
	CommandFailed {
		program: String,
		args: String,
		status: String,
		stdout: String,
		stderr: String,
	},

	#[error("{0} is not supported on this platform")]
	Unsupported(&'static str),

	#[error("invalid egress binding: {0}")]
	InvalidBinding(String),
}

impl RuleError {
	/// Captured standard error of a failed command, if any.
	pub fn stderr(&self) -> Option<&str> {
		match self {
			RuleError::CommandFailed { stderr, .. } => Some(stderr),
			_ => None,
		}
	}
}

pub type Result<T> = std::result::Result<T, RuleError>;
