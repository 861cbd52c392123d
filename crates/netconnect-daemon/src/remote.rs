// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The companion container that configures the VM end of the tunnel.

use crate::error::RemoteError;
use async_trait::async_trait;
use bollard::container::{
	Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
	StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use netconnect_common::SecretString;
use std::fmt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

pub const COMPANION_NAME: &str = "wireguard-setup";

/// A one-shot container run in the VM's host network namespace.
#[derive(Clone)]
pub struct CompanionSpec {
	pub image: String,
	pub name: String,
	pub env: Vec<(String, String)>,
	pub secret_env: Vec<(String, SecretString)>,
}

impl CompanionSpec {
	pub fn new(image: impl Into<String>) -> Self {
		Self {
			image: image.into(),
			name: COMPANION_NAME.to_string(),
			env: Vec::new(),
			secret_env: Vec::new(),
		}
	}

	pub fn env(mut self, key: &str, value: impl ToString) -> Self {
		self.env.push((key.to_string(), value.to_string()));
		self
	}

	pub fn secret_env(mut self, key: &str, value: SecretString) -> Self {
		self.secret_env.push((key.to_string(), value));
		self
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.env
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
			.or_else(|| {
				self.secret_env
					.iter()
					.find(|(k, _)| k == key)
					.map(|(_, v)| v.expose().as_str())
			})
	}

	/// `KEY=value` pairs as handed to the container runtime.
	pub fn container_env(&self) -> Vec<String> {
		self.env
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.chain(
				self.secret_env
					.iter()
					.map(|(k, v)| format!("{k}={}", v.expose())),
			)
			.collect()
	}
}

impl fmt::Debug for CompanionSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompanionSpec")
			.field("image", &self.image)
			.field("name", &self.name)
			.field("env", &self.env)
			.field(
				"secret_env",
				&self.secret_env.iter().map(|(k, v)| (k, v)).collect::<Vec<_>>(),
			)
			.finish()
	}
}

/// Runs the companion to completion. Success means it exited with status 0.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
	async fn run_to_completion(&self, spec: &CompanionSpec) -> Result<(), RemoteError>;
}

pub struct DockerCompanion {
	docker: Docker,
}

impl DockerCompanion {
	pub fn new(docker: Docker) -> Self {
		Self { docker }
	}

	async fn ensure_image(&self, image: &str) -> Result<(), RemoteError> {
		if self.docker.inspect_image(image).await.is_ok() {
			debug!(%image, "image already present");
			return Ok(());
		}

		info!(%image, "pulling companion image");
		let options = CreateImageOptions {
			from_image: image,
			..Default::default()
		};
		let mut pull = self.docker.create_image(Some(options), None, None);
		while let Some(progress) = pull.next().await {
			let progress = progress?;
			if let Some(status) = progress.status {
				debug!(%image, %status, "pull progress");
			}
		}
		Ok(())
	}

	async fn remove(&self, name: &str) -> Result<(), bollard::errors::Error> {
		let options = RemoveContainerOptions {
			force: true,
			..Default::default()
		};
		match self.docker.remove_container(name, Some(options)).await {
			Ok(()) => Ok(()),
			Err(bollard::errors::Error::DockerResponseServerError {
				status_code: 404, ..
			}) => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn stream_logs(docker: Docker, id: String) {
		let options = LogsOptions::<String> {
			follow: true,
			stdout: true,
			stderr: true,
			..Default::default()
		};
		let mut logs = docker.logs(&id, Some(options));
		let mut stdout = tokio::io::stdout();
		let mut stderr = tokio::io::stderr();
		while let Some(chunk) = logs.next().await {
			let written = match chunk {
				Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
					stdout.write_all(&message).await
				}
				Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
				Ok(LogOutput::StdIn { .. }) => Ok(()),
				Err(e) => {
					warn!(error = %e, "companion log stream failed");
					break;
				}
			};
			if written.is_err() {
				break;
			}
		}
		let _ = stdout.flush().await;
		let _ = stderr.flush().await;
	}

	async fn wait(&self, id: &str) -> Result<(), RemoteError> {
		let options = WaitContainerOptions {
			condition: "not-running",
		};
		let mut wait = self.docker.wait_container(id, Some(options));
		match wait.next().await {
			Some(Ok(response)) if response.status_code == 0 => Ok(()),
			Some(Ok(response)) => Err(RemoteError::ExitStatus(response.status_code)),
			Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
				Err(RemoteError::ExitStatus(code))
			}
			Some(Err(e)) => Err(e.into()),
			None => Err(RemoteError::NoStatus),
		}
	}
}

#[async_trait]
impl RemoteRunner for DockerCompanion {
	#[instrument(skip(self, spec), fields(image = %spec.image, name = %spec.name))]
	async fn run_to_completion(&self, spec: &CompanionSpec) -> Result<(), RemoteError> {
		self.ensure_image(&spec.image).await?;
		self.remove(&spec.name).await?;

		let config = Config {
			image: Some(spec.image.clone()),
			env: Some(spec.container_env()),
			host_config: Some(HostConfig {
				network_mode: Some("host".to_string()),
				cap_add: Some(vec!["NET_ADMIN".to_string()]),
				..Default::default()
			}),
			..Default::default()
		};
		let create_options = CreateContainerOptions {
			name: spec.name.clone(),
			platform: None,
		};
		let container = self
			.docker
			.create_container(Some(create_options), config)
			.await?;

		info!("setting up WireGuard on the VM");
		if let Err(e) = self
			.docker
			.start_container(&container.id, None::<StartContainerOptions<String>>)
			.await
		{
			let _ = self.remove(&container.id).await;
			return Err(e.into());
		}

		let logs = tokio::spawn(Self::stream_logs(self.docker.clone(), container.id.clone()));
		let outcome = self.wait(&container.id).await;
		let _ = logs.await;

		if let Err(e) = self.remove(&container.id).await {
			warn!(error = %e, "failed to remove companion container");
		}
		if outcome.is_ok() {
			info!("VM side of the tunnel configured");
		}
		outcome
	}
}
