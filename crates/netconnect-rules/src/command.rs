// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, RuleError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

/// Text captured from a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
	pub stdout: String,
	pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
	pub success: bool,
	pub code: Option<i32>,
	pub output: CommandOutput,
}

impl RawOutput {
	pub fn ok(stdout: impl Into<String>) -> Self {
		Self {
			success: true,
			code: Some(0),
			output: CommandOutput {
				stdout: stdout.into(),
				stderr: String::new(),
			},
		}
	}

	pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
		Self {
			success: false,
			code: Some(code),
			output: CommandOutput {
				stdout: String::new(),
				stderr: stderr.into(),
			},
		}
	}
}

/// Seam between the executors and the OS process table.
#[async_trait]
pub trait CommandRunner: Send + Sync {
	async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
	async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
		trace!(program, ?args, "executing command");

		let output = Command::new(program).args(args).output().await?;

		Ok(RawOutput {
			success: output.status.success(),
			code: output.status.code(),
			output: CommandOutput {
				stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
				stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			},
		})
	}
}

/// Runs a command, treating a failure whose output mentions one of `benign`
/// as success. Used for "already exists" / "not found" style answers.
pub async fn run_tolerant<R>(
	runner: &R,
	program: &str,
	args: &[String],
	benign: &[&str],
) -> Result<CommandOutput>
where
	R: CommandRunner + ?Sized,
{
	let raw = runner
		.run(program, args)
		.await
		.map_err(|source| RuleError::Spawn {
			program: program.to_string(),
			source,
		})?;

	if raw.success {
		return Ok(raw.output);
	}

	let combined = format!("{}{}", raw.output.stdout, raw.output.stderr);
	if benign.iter().any(|needle| combined.contains(needle)) {
		debug!(program, args = %args.join(" "), "command reported an already converged state");
		return Ok(raw.output);
	}

	Err(RuleError::CommandFailed {
		program: program.to_string(),
		args: args.join(" "),
		status: raw
			.code
			.map(|c| format!("status {c}"))
			.unwrap_or_else(|| "signal".to_string()),
		stdout: raw.output.stdout,
		stderr: raw.output.stderr.trim_end().to_string(),
	})
}

pub async fn run_checked<R>(runner: &R, program: &str, args: &[String]) -> Result<CommandOutput>
where
	R: CommandRunner + ?Sized,
{
	run_tolerant(runner, program, args, &[]).await
}

/// Builds an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
	I: IntoIterator<Item = S>,
	S: Into<String>,
{
	items.into_iter().map(Into::into).collect()
}
