// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Context;
use clap::Parser;
use netconnect_daemon::{Args, DaemonConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();
	netconnect_common::init_tracing_with_level(args.log_level.as_deref());

	match start(args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(error = format!("{e:#}"), "netconnect failed");
			ExitCode::FAILURE
		}
	}
}

async fn start(args: Args) -> anyhow::Result<()> {
	let config = DaemonConfig::try_from(args).context("invalid configuration")?;
	netconnect_daemon::run(config)
		.await
		.context("network bridge failed")
}
