//! Bus transport: one Unix socket connection with correlated replies and
//! signal demultiplexing.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use signon_types::prelude::*;
use signon_types::wire::{Call, ClientFrame, ServerFrame};

/// Failure of a single call on the wire.
#[derive(Debug, Clone)]
pub enum CallError {
	/// The daemon answered with an error frame.
	Remote { code: u32, message: String },
	/// The transport died before the reply arrived.
	Disconnected,
}

impl CallError {
	pub fn into_error(self) -> Error {
		match self {
			CallError::Remote { code, message } => Error::from_code(code, &message),
			CallError::Disconnected => Error::InternalCommunication,
		}
	}
}

type ReplySender = oneshot::Sender<Result<serde_json::Value, CallError>>;

/// Waiter for one in-flight call's reply.
pub(crate) struct PendingReply {
	rx: oneshot::Receiver<Result<serde_json::Value, CallError>>,
}

impl PendingReply {
	pub(crate) async fn wait(self) -> Result<serde_json::Value, CallError> {
		self.rx.await.unwrap_or(Err(CallError::Disconnected))
	}
}

struct SignalRoute {
	path: Box<str>,
	name: Box<str>,
	sender: mpsc::UnboundedSender<serde_json::Value>,
}

struct ConnInner {
	out_tx: mpsc::Sender<ClientFrame>,
	pending: Mutex<HashMap<u64, ReplySender>>,
	routes: Mutex<Vec<SignalRoute>>,
	next_id: AtomicU64,
	alive: watch::Sender<bool>,
}

/// One live connection to the daemon. Clones share the socket.
#[derive(Clone)]
pub struct Connection {
	inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection").field("alive", &self.is_alive()).finish()
	}
}

impl Connection {
	pub async fn connect(socket: &Path) -> SsoResult<Connection> {
		let stream = UnixStream::connect(socket).await.map_err(|err| {
			debug!("cannot reach daemon at {}: {}", socket.display(), err);
			Error::ServiceNotAvailable
		})?;
		let (read_half, write_half) = stream.into_split();

		let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
		let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(frame) = out_rx.recv().await {
				let Ok(encoded) = serde_json::to_vec(&frame) else { continue };
				if sink.send(Bytes::from(encoded)).await.is_err() {
					break;
				}
			}
		});

		let (alive, _) = watch::channel(true);
		let inner = Arc::new(ConnInner {
			out_tx,
			pending: Mutex::new(HashMap::new()),
			routes: Mutex::new(Vec::new()),
			next_id: AtomicU64::new(1),
			alive,
		});

		let reader_inner = Arc::clone(&inner);
		let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(Ok(frame)) = source.next().await {
				let frame = match serde_json::from_slice::<ServerFrame>(&frame) {
					Ok(frame) => frame,
					Err(err) => {
						warn!("undecodable daemon frame: {}", err);
						continue;
					}
				};
				match frame {
					ServerFrame::Reply { id, result } => {
						let waiter = reader_inner.pending.lock().ok().and_then(|mut p| p.remove(&id));
						if let Some(waiter) = waiter {
							let _ = waiter.send(Ok(result));
						}
					}
					ServerFrame::Error { id, code, message } => {
						let waiter = reader_inner.pending.lock().ok().and_then(|mut p| p.remove(&id));
						if let Some(waiter) = waiter {
							let _ = waiter.send(Err(CallError::Remote { code, message }));
						}
					}
					ServerFrame::Signal { path, name, args } => {
						if let Ok(mut routes) = reader_inner.routes.lock() {
							routes.retain(|route| {
								if route.path == path && route.name == name {
									route.sender.send(args.clone()).is_ok()
								} else {
									true
								}
							});
						}
					}
				}
			}

			// Transport is gone: fail whatever is still waiting.
			let _ = reader_inner.alive.send(false);
			let waiters: Vec<ReplySender> = reader_inner
				.pending
				.lock()
				.map(|mut p| p.drain().map(|(_, w)| w).collect())
				.unwrap_or_default();
			for waiter in waiters {
				let _ = waiter.send(Err(CallError::Disconnected));
			}
		});

		Ok(Connection { inner })
	}

	pub fn is_alive(&self) -> bool {
		*self.inner.alive.borrow()
	}

	/// Watch that flips to false when the transport dies.
	pub fn alive_watch(&self) -> watch::Receiver<bool> {
		self.inner.alive.subscribe()
	}

	pub async fn call(&self, path: &str, call: Call) -> Result<serde_json::Value, CallError> {
		self.begin_call(path, call).await?.wait().await
	}

	/// Sends the request and returns a waiter for its reply. Splitting
	/// the phases lets callers keep submission order without serializing
	/// on each other's replies.
	pub(crate) async fn begin_call(
		&self,
		path: &str,
		call: Call,
	) -> Result<PendingReply, CallError> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		if let Ok(mut pending) = self.inner.pending.lock() {
			pending.insert(id, tx);
		}

		let frame = ClientFrame { id, path: path.into(), call };
		if self.inner.out_tx.send(frame).await.is_err() {
			if let Ok(mut pending) = self.inner.pending.lock() {
				pending.remove(&id);
			}
			return Err(CallError::Disconnected);
		}

		Ok(PendingReply { rx })
	}

	/// Routes matching signals to the returned receiver until it is
	/// dropped.
	pub fn subscribe(&self, path: &str, name: &str) -> mpsc::UnboundedReceiver<serde_json::Value> {
		let (sender, receiver) = mpsc::unbounded_channel();
		if let Ok(mut routes) = self.inner.routes.lock() {
			routes.push(SignalRoute { path: path.into(), name: name.into(), sender });
		}
		receiver
	}
}

// vim: ts=4
