// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::SourceError;
use crate::network::NetworkRecord;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
	Created { id: String },
	Destroyed { id: String },
}

impl NetworkEvent {
	pub fn id(&self) -> &str {
		match self {
			NetworkEvent::Created { id } | NetworkEvent::Destroyed { id } => id,
		}
	}
}

pub type EventStream = BoxStream<'static, Result<NetworkEvent, SourceError>>;

/// Read-only view of the container runtime's networks.
#[async_trait]
pub trait NetworkSource: Send + Sync {
	async fn list(&self) -> Result<Vec<NetworkRecord>, SourceError>;

	async fn inspect(&self, id: &str) -> Result<NetworkRecord, SourceError>;

	/// Subscribes to network create and destroy notifications. Events are
	/// yielded in delivery order; the stream ends or yields an error when the
	/// subscription breaks.
	async fn watch(&self) -> Result<EventStream, SourceError>;
}
