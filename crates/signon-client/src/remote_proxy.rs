//! Async IPC proxy.
//!
//! Lets the handle layer issue calls before the transport exists or the
//! remote object path is known. Calls queue until both are present, then
//! dispatch strictly in order. A call that races the destruction of its
//! remote object (the daemon answers `no-object`) is re-queued instead of
//! failed, so identity re-registration is transparent to callers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};

use signon_types::prelude::*;
use signon_types::wire::{Call, NO_OBJECT};

use crate::connection::{CallError, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
	/// Connection or object path still missing; calls queue.
	Incomplete,
	Ready,
	/// A fatal transport error was observed; calls fail immediately.
	Invalid,
}

struct QueuedCall {
	call: Call,
	reply: oneshot::Sender<SsoResult<serde_json::Value>>,
	canceled: Arc<AtomicBool>,
}

/// Reply deadline per call kind. Operations that may legitimately sit on
/// a user dialog for minutes run unbounded; everything else times out.
fn call_timeout(call: &Call) -> Option<std::time::Duration> {
	match call {
		Call::Process { .. }
		| Call::VerifyUser { .. }
		| Call::RequestCredentialsUpdate { .. } => None,
		_ => Some(std::time::Duration::from_secs(30)),
	}
}

struct SignalSub {
	name: Box<str>,
	sender: mpsc::UnboundedSender<serde_json::Value>,
}

#[derive(Default)]
struct ProxyData {
	connection: Option<Connection>,
	path: Option<Box<str>>,
	invalid: Option<Error>,
	queue: VecDeque<QueuedCall>,
	subs: Vec<SignalSub>,
	/// Bumped on every (connection, path) change; stale signal
	/// forwarders notice and stop.
	sub_generation: u64,
	draining: bool,
}

struct ProxyShared {
	data: Mutex<ProxyData>,
	/// Poked whenever the proxy needs the upper layer to (re)establish
	/// the connection or the registration.
	attention: Notify,
}

/// Handle to one remote object that may not exist yet.
#[derive(Clone)]
pub struct RemoteObjectProxy {
	shared: Arc<ProxyShared>,
}

impl std::fmt::Debug for RemoteObjectProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RemoteObjectProxy").field("state", &self.state()).finish()
	}
}

/// A call sitting in (or already past) the proxy queue.
pub struct PendingCall {
	rx: oneshot::Receiver<SsoResult<serde_json::Value>>,
	canceled: Arc<AtomicBool>,
}

impl PendingCall {
	/// Cancels the call if it has not been dispatched yet; afterwards
	/// this is advisory and the reply arrives anyway.
	pub fn cancel(&self) {
		self.canceled.store(true, Ordering::Relaxed);
	}

	pub async fn result(self) -> SsoResult<serde_json::Value> {
		self.rx.await.unwrap_or(Err(Error::InternalCommunication))
	}
}

impl Default for RemoteObjectProxy {
	fn default() -> Self {
		Self::new()
	}
}

impl RemoteObjectProxy {
	pub fn new() -> Self {
		RemoteObjectProxy {
			shared: Arc::new(ProxyShared {
				data: Mutex::new(ProxyData::default()),
				attention: Notify::new(),
			}),
		}
	}

	pub fn state(&self) -> ProxyState {
		match self.shared.data.lock() {
			Ok(data) => {
				if data.invalid.is_some() {
					ProxyState::Invalid
				} else if data.connection.is_some() && data.path.is_some() {
					ProxyState::Ready
				} else {
					ProxyState::Incomplete
				}
			}
			Err(_) => ProxyState::Invalid,
		}
	}

	/// Resolves whenever the proxy wants the upper layer to reconnect or
	/// re-register.
	pub async fn attention(&self) {
		self.shared.attention.notified().await;
	}

	/// Wakes everyone blocked in [`RemoteObjectProxy::attention`];
	/// handles use this on drop so their watcher tasks can exit.
	pub fn poke(&self) {
		self.shared.attention.notify_waiters();
	}

	pub fn queue_call(&self, call: Call) -> PendingCall {
		let (tx, rx) = oneshot::channel();
		let canceled = Arc::new(AtomicBool::new(false));
		let pending = PendingCall { rx, canceled: Arc::clone(&canceled) };

		let mut needs_attention = false;
		if let Ok(mut data) = self.shared.data.lock() {
			if let Some(err) = &data.invalid {
				let _ = tx.send(Err(err.clone()));
				return pending;
			}
			data.queue.push_back(QueuedCall { call, reply: tx, canceled });
			if data.connection.is_none() {
				needs_attention = true;
			}
		}
		if needs_attention {
			self.shared.attention.notify_waiters();
		}
		self.maybe_drain();
		pending
	}

	pub fn set_connection(&self, connection: Connection) {
		if let Ok(mut data) = self.shared.data.lock() {
			data.connection = Some(connection);
			data.invalid = None;
			data.sub_generation += 1;
		}
		self.apply_subscriptions();
		self.maybe_drain();
	}

	pub fn set_object_path(&self, path: impl Into<Box<str>>) {
		if let Ok(mut data) = self.shared.data.lock() {
			data.path = Some(path.into());
			data.sub_generation += 1;
		}
		self.apply_subscriptions();
		self.maybe_drain();
	}

	/// Forgets the object path; queued and future calls wait for a new
	/// registration.
	pub fn clear_object_path(&self) {
		if let Ok(mut data) = self.shared.data.lock() {
			data.path = None;
			data.sub_generation += 1;
		}
	}

	pub fn set_disconnected(&self) {
		if let Ok(mut data) = self.shared.data.lock() {
			data.connection = None;
			data.sub_generation += 1;
		}
		self.shared.attention.notify_waiters();
	}

	/// Marks the proxy broken; everything queued (and queued later)
	/// fails with the error.
	pub fn set_error(&self, err: Error) {
		let drained = match self.shared.data.lock() {
			Ok(mut data) => {
				data.invalid = Some(err.clone());
				data.queue.drain(..).collect::<Vec<_>>()
			}
			Err(_) => Vec::new(),
		};
		for entry in drained {
			let _ = entry.reply.send(Err(err.clone()));
		}
	}

	/// Fails every queued call without invalidating the proxy. Used when
	/// a registration attempt fails.
	pub fn fail_queue(&self, err: Error) {
		let drained = match self.shared.data.lock() {
			Ok(mut data) => data.queue.drain(..).collect::<Vec<_>>(),
			Err(_) => Vec::new(),
		};
		for entry in drained {
			let _ = entry.reply.send(Err(err.clone()));
		}
	}

	/// Remembers the subscription and re-applies it after every
	/// transition into Ready.
	pub fn connect_signal(&self, name: &str) -> mpsc::UnboundedReceiver<serde_json::Value> {
		let (sender, receiver) = mpsc::unbounded_channel();
		if let Ok(mut data) = self.shared.data.lock() {
			data.subs.push(SignalSub { name: name.into(), sender });
		}
		self.apply_subscriptions();
		receiver
	}

	fn apply_subscriptions(&self) {
		let (connection, path, generation, subs) = match self.shared.data.lock() {
			Ok(data) => {
				let (Some(connection), Some(path)) = (data.connection.clone(), data.path.clone())
				else {
					return;
				};
				let subs: Vec<(Box<str>, mpsc::UnboundedSender<serde_json::Value>)> =
					data.subs.iter().map(|s| (s.name.clone(), s.sender.clone())).collect();
				(connection, path, data.sub_generation, subs)
			}
			Err(_) => return,
		};

		for (name, sender) in subs {
			let mut source = connection.subscribe(&path, &name);
			let shared = Arc::clone(&self.shared);
			tokio::spawn(async move {
				while let Some(args) = source.recv().await {
					let current = shared.data.lock().map(|d| d.sub_generation).unwrap_or(0);
					if current != generation {
						return;
					}
					if sender.send(args).is_err() {
						return;
					}
				}
			});
		}
	}

	fn maybe_drain(&self) {
		{
			let Ok(mut data) = self.shared.data.lock() else { return };
			if data.draining
				|| data.queue.is_empty()
				|| data.connection.is_none()
				|| data.path.is_none()
			{
				return;
			}
			data.draining = true;
		}
		let proxy = self.clone();
		tokio::spawn(async move { proxy.drain().await });
	}

	/// Puts a dispatched-but-failed call back at the head of the queue
	/// and asks the upper layer to re-establish what was lost.
	fn requeue(&self, entry: QueuedCall, lost_path: bool, lost_connection: bool) {
		if let Ok(mut data) = self.shared.data.lock() {
			if lost_path {
				data.path = None;
			}
			if lost_connection {
				data.connection = None;
			}
			data.sub_generation += 1;
			data.queue.push_front(entry);
		}
		self.shared.attention.notify_waiters();
		// A racing re-registration may already have restored the path;
		// make sure the entry does not sit in a ready queue forever.
		self.maybe_drain();
	}

	/// Dispatches queued calls in submission order. Replies are awaited
	/// on separate tasks so a slow call (an auth round trip can sit on a
	/// dialog for minutes) never blocks a later cancel.
	async fn drain(&self) {
		loop {
			let (connection, path, entry) = {
				let Ok(mut data) = self.shared.data.lock() else { return };
				let (Some(connection), Some(path)) = (data.connection.clone(), data.path.clone())
				else {
					data.draining = false;
					return;
				};
				let Some(entry) = data.queue.pop_front() else {
					data.draining = false;
					return;
				};
				(connection, path, entry)
			};

			if entry.canceled.load(Ordering::Relaxed) {
				let _ = entry.reply.send(Err(Error::IdentityOperationCanceled));
				continue;
			}

			match connection.begin_call(&path, entry.call.clone()).await {
				Err(_) => {
					self.requeue(entry, false, true);
					if let Ok(mut data) = self.shared.data.lock() {
						data.draining = false;
					}
					return;
				}
				Ok(reply) => {
					let proxy = self.clone();
					let deadline = call_timeout(&entry.call);
					tokio::spawn(async move {
						let outcome = match deadline {
							Some(deadline) => {
								match tokio::time::timeout(deadline, reply.wait()).await {
									Ok(outcome) => outcome,
									Err(_) => {
										let _ = entry.reply.send(Err(Error::TimedOut));
										return;
									}
								}
							}
							None => reply.wait().await,
						};
						match outcome {
							Ok(value) => {
								let _ = entry.reply.send(Ok(value));
							}
							Err(CallError::Remote { message, .. }) if message == NO_OBJECT => {
								// The remote object died under the call;
								// recover through re-registration.
								debug!("remote object at {} gone, re-queueing call", path);
								proxy.requeue(entry, true, false);
							}
							Err(CallError::Remote { code, message }) => {
								let _ =
									entry.reply.send(Err(Error::from_code(code, &message)));
							}
							Err(CallError::Disconnected) => {
								proxy.requeue(entry, false, true);
							}
						}
					});
				}
			}
		}
	}
}


// vim: ts=4
