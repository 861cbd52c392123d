// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Context;
use netconnect_rules::SystemRunner;
use netconnect_setup::{resolve_endpoint, SetupConfig, SetupScope, VmTunnel};
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	netconnect_common::init_tracing();

	match start().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(error = format!("{e:#}"), "remote setup failed");
			ExitCode::FAILURE
		}
	}
}

async fn start() -> anyhow::Result<()> {
	let config = SetupConfig::from_env().context("invalid configuration")?;
	let tunnel = VmTunnel::new(SystemRunner);
	match config.scope {
		SetupScope::Full => {
			let endpoint = resolve_endpoint(&config.host_endpoint())
				.await
				.context("could not find the host end")?;
			netconnect_setup::run(&config, &tunnel, endpoint).await?;
		}
		SetupScope::Egress => {
			netconnect_setup::apply_egress(&config, tunnel.executor()).await;
		}
	}
	Ok(())
}
