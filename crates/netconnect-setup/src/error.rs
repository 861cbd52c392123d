// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),
}

#[derive(Debug, Error)]
pub enum SetupError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("link error: {0}")]
	Link(#[from] netconnect_rules::RuleError),

	#[error("could not resolve {endpoint}: {reason}")]
	Resolve { endpoint: String, reason: String },

	#[error("could not stage private key: {0}")]
	KeyFile(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SetupError>;
