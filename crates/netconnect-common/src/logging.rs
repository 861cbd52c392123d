// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Maps the `LOG_LEVEL` vocabulary onto an `EnvFilter` directive.
pub fn level_directive(level: Option<&str>) -> &'static str {
	match level.map(str::trim) {
		Some("verbose") | Some("debug") => "debug",
		Some("error") => "error",
		Some("silent") => "off",
		_ => "info",
	}
}

/// `RUST_LOG` takes precedence; `level` is the fallback.
pub fn env_filter(level: Option<&str>) -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)))
}

/// Installs the global subscriber using `LOG_LEVEL` from the environment.
pub fn init_tracing() {
	let level = std::env::var(LOG_LEVEL_ENV).ok();
	init_tracing_with_level(level.as_deref());
}

pub fn init_tracing_with_level(level: Option<&str>) {
	tracing_subscriber::fmt()
		.with_env_filter(env_filter(level))
		.with_target(false)
		.init();
}
