// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use netconnect_engine::{
	Bootstrap, EgressObserver, EventStream, NetworkEvent, NetworkRecord, NetworkScope,
	NetworkSource, SourceError,
};
use netconnect_rules::EgressBinding;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// One item of a scripted watch session.
#[derive(Debug, Clone)]
pub enum Step {
	/// The runtime gains a network; no notification is emitted.
	Appear(NetworkRecord),
	/// The runtime loses a network; no notification is emitted.
	Vanish(String),
	Event(NetworkEvent),
	Fail(String),
}

pub fn created(id: &str) -> Step {
	Step::Event(NetworkEvent::Created { id: id.to_string() })
}

pub fn destroyed(id: &str) -> Step {
	Step::Event(NetworkEvent::Destroyed { id: id.to_string() })
}

type Queue = Arc<Mutex<VecDeque<Step>>>;

/// Network source whose watch sessions are scripted up front. The
/// subscription opened after every session has been handed out requests
/// shutdown once its queue drains.
pub struct FakeSource {
	networks: Arc<Mutex<Vec<NetworkRecord>>>,
	sessions: Mutex<VecDeque<Vec<Step>>>,
	live: Mutex<Option<Queue>>,
	arrivals: Mutex<Vec<NetworkRecord>>,
	list_failures: AtomicUsize,
	list_calls: AtomicUsize,
	shutdown: Arc<watch::Sender<bool>>,
}

impl FakeSource {
	pub fn new(networks: Vec<NetworkRecord>, shutdown: watch::Sender<bool>) -> Self {
		Self {
			networks: Arc::new(Mutex::new(networks)),
			sessions: Mutex::new(VecDeque::new()),
			live: Mutex::new(None),
			arrivals: Mutex::new(Vec::new()),
			list_failures: AtomicUsize::new(0),
			list_calls: AtomicUsize::new(0),
			shutdown: Arc::new(shutdown),
		}
	}

	pub fn session(self, steps: Vec<Step>) -> Self {
		self.sessions.lock().unwrap().push_back(steps);
		self
	}

	pub fn failing_lists(self, count: usize) -> Self {
		self.list_failures.store(count, Ordering::SeqCst);
		self
	}

	/// `record` is created right after the next successful listing took its
	/// snapshot. Its notification reaches only an already open subscription.
	pub fn arriving_during_list(self, record: NetworkRecord) -> Self {
		self.arrivals.lock().unwrap().push(record);
		self
	}

	pub fn list_calls(&self) -> usize {
		self.list_calls.load(Ordering::SeqCst)
	}

	pub fn set_networks(&self, networks: Vec<NetworkRecord>) {
		*self.networks.lock().unwrap() = networks;
	}
}

struct Subscription {
	queue: Queue,
	networks: Arc<Mutex<Vec<NetworkRecord>>>,
	shutdown: Arc<watch::Sender<bool>>,
	last: bool,
}

#[async_trait]
impl NetworkSource for FakeSource {
	async fn list(&self) -> Result<Vec<NetworkRecord>, SourceError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		let remaining = self.list_failures.load(Ordering::SeqCst);
		if remaining > 0 {
			self.list_failures.store(remaining - 1, Ordering::SeqCst);
			return Err(SourceError::Runtime("daemon unavailable".to_string()));
		}
		let snapshot = self.networks.lock().unwrap().clone();

		let arrivals: Vec<_> = self.arrivals.lock().unwrap().drain(..).collect();
		for record in arrivals {
			let id = record.id.clone();
			self.networks.lock().unwrap().push(record);
			if let Some(queue) = self.live.lock().unwrap().as_ref() {
				queue.lock().unwrap().push_back(created(&id));
			}
		}
		Ok(snapshot)
	}

	async fn inspect(&self, id: &str) -> Result<NetworkRecord, SourceError> {
		self.networks
			.lock()
			.unwrap()
			.iter()
			.find(|n| n.id == id)
			.cloned()
			.ok_or_else(|| SourceError::NotFound(id.to_string()))
	}

	async fn watch(&self) -> Result<EventStream, SourceError> {
		let scripted = self.sessions.lock().unwrap().pop_front();
		let last = scripted.is_none();
		let queue: Queue = Arc::new(Mutex::new(scripted.unwrap_or_default().into()));
		*self.live.lock().unwrap() = Some(Arc::clone(&queue));

		let subscription = Subscription {
			queue,
			networks: Arc::clone(&self.networks),
			shutdown: Arc::clone(&self.shutdown),
			last,
		};
		let stream = futures::stream::unfold(subscription, |sub| async move {
			loop {
				let step = sub.queue.lock().unwrap().pop_front();
				match step {
					Some(Step::Appear(record)) => sub.networks.lock().unwrap().push(record),
					Some(Step::Vanish(id)) => sub.networks.lock().unwrap().retain(|n| n.id != id),
					Some(Step::Event(event)) => return Some((Ok(event), sub)),
					Some(Step::Fail(reason)) => {
						return Some((Err(SourceError::Runtime(reason)), sub));
					}
					None if sub.last => {
						let _ = sub.shutdown.send(true);
						futures::future::pending::<()>().await;
					}
					None => return None,
				}
			}
		});
		Ok(stream.boxed())
	}
}

pub struct StubBootstrap {
	pub result: Result<String, std::io::Error>,
	pub calls: usize,
}

impl StubBootstrap {
	pub fn up(interface: &str) -> Self {
		Self {
			result: Ok(interface.to_string()),
			calls: 0,
		}
	}

	pub fn failing(reason: &str) -> Self {
		Self {
			result: Err(std::io::Error::new(std::io::ErrorKind::Other, reason.to_string())),
			calls: 0,
		}
	}
}

#[async_trait]
impl Bootstrap for StubBootstrap {
	type Error = std::io::Error;

	async fn bootstrap(&mut self, _shutdown: watch::Receiver<bool>) -> Result<String, Self::Error> {
		self.calls += 1;
		match &self.result {
			Ok(interface) => Ok(interface.clone()),
			Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
		}
	}
}

/// Keeps every binding set it is told about.
#[derive(Default)]
pub struct EgressLog {
	pub seen: Mutex<Vec<Vec<EgressBinding>>>,
}

impl EgressLog {
	pub fn last(&self) -> Option<Vec<EgressBinding>> {
		self.seen.lock().unwrap().last().cloned()
	}
}

#[async_trait]
impl EgressObserver for EgressLog {
	async fn egress_changed(&self, bindings: &[EgressBinding]) {
		self.seen.lock().unwrap().push(bindings.to_vec());
	}
}

pub fn local(id: &str, cidr: &str) -> NetworkRecord {
	NetworkRecord::new(id, id, NetworkScope::Local).with_subnet(cidr)
}
