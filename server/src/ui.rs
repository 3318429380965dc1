//! UI prompt service binding.
//!
//! The daemon talks to the UI service over a framed Unix socket with the
//! dialog schema from `signon_types::ui`. Dialogs are correlated by the
//! `RequestId` the session engine stamps on every request, so replies may
//! arrive in any order. Without a configured service (or with the service
//! gone) every query resolves to `QUERY_ERROR_NO_SIGNONUI`, which the
//! plugins see and handle like any other dialog failure.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use signon_types::ui::{UiAdapter, UI_KEY_ERROR, UI_KEY_REQUEST_ID, QUERY_ERROR_NO_SIGNONUI};

pub use signon_types::ui::NoUi;

use crate::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum UiServiceRequest {
	QueryDialog { params: SessionData },
	RefreshDialog { params: SessionData },
	CancelRequest { request_id: Box<str> },
}

#[derive(Debug, Serialize, Deserialize)]
struct UiServiceReply {
	request_id: Box<str>,
	result: SessionData,
}

struct UiLink {
	requests: mpsc::Sender<UiServiceRequest>,
}

/// Proxy to the external UI service socket. Connects lazily on the first
/// dialog and reconnects on demand after the service restarts.
pub struct UiProxy {
	socket_path: PathBuf,
	link: Mutex<Option<UiLink>>,
	pending: Arc<Mutex<HashMap<Box<str>, oneshot::Sender<SessionData>>>>,
}

impl std::fmt::Debug for UiProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UiProxy").field("socket_path", &self.socket_path).finish()
	}
}

impl UiProxy {
	pub fn new(socket_path: PathBuf) -> Self {
		UiProxy {
			socket_path,
			link: Mutex::new(None),
			pending: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	async fn connect(&self) -> SsoResult<()> {
		let mut link = self.link.lock().await;
		if link.is_some() {
			return Ok(());
		}

		let stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
			debug!("ui service unavailable at {}: {}", self.socket_path.display(), err);
			Error::UserInteraction
		})?;
		let (read_half, write_half) = stream.into_split();

		let (requests, mut request_rx) = mpsc::channel::<UiServiceRequest>(16);
		let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(request) = request_rx.recv().await {
				let Ok(encoded) = serde_json::to_vec(&request) else { continue };
				if sink.send(Bytes::from(encoded)).await.is_err() {
					break;
				}
			}
		});

		let pending = Arc::clone(&self.pending);
		let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(Ok(frame)) = source.next().await {
				match serde_json::from_slice::<UiServiceReply>(&frame) {
					Ok(reply) => {
						let waiter = pending.lock().await.remove(&reply.request_id);
						if let Some(waiter) = waiter {
							let _ = waiter.send(reply.result);
						}
					}
					Err(err) => warn!("undecodable ui service frame: {}", err),
				}
			}
			// Service went away; fail everything that was on screen.
			let mut no_ui = SessionData::new();
			no_ui.insert(UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
			for (_, waiter) in pending.lock().await.drain() {
				let _ = waiter.send(no_ui.clone());
			}
		});

		*link = Some(UiLink { requests });
		Ok(())
	}

	async fn round_trip(&self, params: SessionData, refresh: bool) -> SsoResult<SessionData> {
		let request_id: Box<str> = params
			.get(UI_KEY_REQUEST_ID)
			.and_then(|v| v.as_str())
			.ok_or(Error::InvalidQuery)?
			.into();

		if self.connect().await.is_err() {
			let mut reply = SessionData::new();
			reply.insert(UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
			return Ok(reply);
		}

		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(request_id.clone(), tx);

		let request = if refresh {
			UiServiceRequest::RefreshDialog { params }
		} else {
			UiServiceRequest::QueryDialog { params }
		};
		let sent = {
			let link = self.link.lock().await;
			match link.as_ref() {
				Some(link) => link.requests.send(request).await.is_ok(),
				None => false,
			}
		};
		if !sent {
			// Connection died between connect and send; drop the link so
			// the next dialog reconnects.
			*self.link.lock().await = None;
			self.pending.lock().await.remove(&request_id);
			let mut reply = SessionData::new();
			reply.insert(UI_KEY_ERROR.into(), QUERY_ERROR_NO_SIGNONUI.into());
			return Ok(reply);
		}

		rx.await.map_err(|_| Error::UserInteraction)
	}
}

#[async_trait]
impl UiAdapter for UiProxy {
	async fn query_dialog(&self, params: SessionData) -> SsoResult<SessionData> {
		self.round_trip(params, false).await
	}

	async fn refresh_dialog(&self, params: SessionData) -> SsoResult<SessionData> {
		self.round_trip(params, true).await
	}

	async fn cancel_ui_request(&self, request_id: &str) -> SsoResult<()> {
		// Drop the local waiter first so a late reply is ignored even if
		// the service never answers the cancel.
		self.pending.lock().await.remove(request_id);
		let link = self.link.lock().await;
		if let Some(link) = link.as_ref() {
			let _ = link
				.requests
				.send(UiServiceRequest::CancelRequest { request_id: request_id.into() })
				.await;
		}
		Ok(())
	}
}

// vim: ts=4
