//! Bus server.
//!
//! One task per connection reads length-delimited JSON frames, spawns one
//! task per request (replies are correlated, so long operations never
//! block the connection) and forwards object signals the connection has
//! become interested in. Peer credentials come from SO_PEERCRED and feed
//! the access-control gate.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use signon_types::access_control::Peer;
use signon_types::wire::{
	ClientFrame, ServerFrame, SIG_INFO_UPDATED, SIG_STATE_CHANGED, SIG_UNREGISTERED,
};

use crate::daemon::Daemon;
use crate::identity::IdentitySignal;
use crate::prelude::*;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Creates the bus socket. The containing directory is (re)created with
/// mode 0700 and a stale socket file is removed first.
pub fn bind_socket(path: &Path) -> SsoResult<UnixListener> {
	use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

	if let Some(parent) = path.parent() {
		if !parent.exists() {
			std::fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
		}
	}
	if path.exists() {
		std::fs::remove_file(path)?;
	}
	let listener = UnixListener::bind(path)?;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
	info!("bus listening on {}", path.display());
	Ok(listener)
}

pub async fn serve(daemon: Arc<Daemon>, listener: UnixListener) {
	loop {
		match listener.accept().await {
			Ok((stream, _)) => {
				let daemon = Arc::clone(&daemon);
				tokio::spawn(async move {
					let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
					handle_connection(daemon, stream, conn).await;
				});
			}
			Err(err) => {
				warn!("bus accept failed: {}", err);
				return;
			}
		}
	}
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream, conn: u64) {
	let peer = match stream.peer_cred() {
		Ok(cred) => Peer {
			pid: cred.pid().unwrap_or_default().unsigned_abs(),
			uid: cred.uid(),
		},
		Err(err) => {
			warn!("peer credentials unavailable, dropping connection: {}", err);
			return;
		}
	};
	debug!("connection {} from pid {} uid {}", conn, peer.pid, peer.uid);

	let (read_half, write_half) = stream.into_split();
	let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());
	let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());

	let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);
	let writer = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let encoded = match serde_json::to_vec(&frame) {
				Ok(encoded) => encoded,
				Err(err) => {
					warn!("unencodable server frame: {}", err);
					continue;
				}
			};
			if sink.send(Bytes::from(encoded)).await.is_err() {
				break;
			}
		}
	});

	// Paths whose signals this connection receives.
	let mut subscribed: HashSet<Box<str>> = HashSet::new();
	let (sub_tx, mut sub_rx) = mpsc::channel::<Box<str>>(16);

	loop {
		tokio::select! {
			frame = source.next() => {
				let Some(frame) = frame else { break };
				let frame = match frame {
					Ok(frame) => frame,
					Err(err) => {
						warn!("connection {} read failed: {}", conn, err);
						break;
					}
				};
				let request: ClientFrame = match serde_json::from_slice(&frame) {
					Ok(request) => request,
					Err(err) => {
						warn!("connection {} sent garbage: {}", conn, err);
						break;
					}
				};

				subscribe(&daemon, &mut subscribed, &request.path, conn, &out_tx);

				let daemon = Arc::clone(&daemon);
				let out_tx = out_tx.clone();
				let sub_tx = sub_tx.clone();
				let peer = peer.clone();
				tokio::spawn(async move {
					let id = request.id;
					let result = daemon.dispatch(conn, &peer, &request.path, request.call).await;
					let frame = match result {
						Ok(result) => {
							// Replies that hand out a new object imply
							// interest in its signals.
							if let Some(path) = result.get("path").and_then(|v| v.as_str()) {
								let _ = sub_tx.send(path.into()).await;
							}
							ServerFrame::Reply { id, result }
						}
						Err(Error::User(code, message)) => {
							ServerFrame::Error { id, code, message: message.into() }
						}
						Err(err) => ServerFrame::Error {
							id,
							code: err.code(),
							message: err.to_string(),
						},
					};
					let _ = out_tx.send(frame).await;
				});
			}
			Some(path) = sub_rx.recv() => {
				subscribe(&daemon, &mut subscribed, &path, conn, &out_tx);
			}
		}
	}

	writer.abort();
	debug!("connection {} closed", conn);
}

/// Starts a signal forwarder for the object at `path`, once per
/// connection and path.
fn subscribe(
	daemon: &Arc<Daemon>,
	subscribed: &mut HashSet<Box<str>>,
	path: &str,
	conn: u64,
	out_tx: &mpsc::Sender<ServerFrame>,
) {
	if path == signon_types::wire::DAEMON_PATH || subscribed.contains(path) {
		return;
	}
	if let Some(identity) = daemon.identity_at(path) {
		subscribed.insert(path.into());
		let mut signals = identity.subscribe();
		let out_tx = out_tx.clone();
		let path: Box<str> = path.into();
		tokio::spawn(async move {
			loop {
				match signals.recv().await {
					Ok(IdentitySignal::InfoUpdated { change, exclude_conn }) => {
						if exclude_conn == Some(conn) {
							continue;
						}
						let frame = ServerFrame::Signal {
							path: path.clone(),
							name: SIG_INFO_UPDATED.into(),
							args: serde_json::json!([i32::from(change)]),
						};
						if out_tx.send(frame).await.is_err() {
							return;
						}
					}
					Ok(IdentitySignal::Unregistered) => {
						let frame = ServerFrame::Signal {
							path: path.clone(),
							name: SIG_UNREGISTERED.into(),
							args: serde_json::json!([]),
						};
						let _ = out_tx.send(frame).await;
						return;
					}
					Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("connection {} lagged {} identity signals", conn, skipped);
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => {
						let frame = ServerFrame::Signal {
							path: path.clone(),
							name: SIG_UNREGISTERED.into(),
							args: serde_json::json!([]),
						};
						let _ = out_tx.send(frame).await;
						return;
					}
				}
			}
		});
	} else if let Some(session) = daemon.session_at(path) {
		subscribed.insert(path.into());
		let mut signals = session.subscribe();
		let out_tx = out_tx.clone();
		let path: Box<str> = path.into();
		tokio::spawn(async move {
			loop {
				match signals.recv().await {
					Ok(signal) => {
						let frame = ServerFrame::Signal {
							path: path.clone(),
							name: SIG_STATE_CHANGED.into(),
							args: serde_json::json!([signal.state, signal.message]),
						};
						if out_tx.send(frame).await.is_err() {
							return;
						}
					}
					Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("connection {} lagged {} session signals", conn, skipped);
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => {
						let frame = ServerFrame::Signal {
							path: path.clone(),
							name: SIG_UNREGISTERED.into(),
							args: serde_json::json!([]),
						};
						let _ = out_tx.send(frame).await;
						return;
					}
				}
			}
		});
	}
}

// vim: ts=4
