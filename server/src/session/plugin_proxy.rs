//! Plugin worker proxy.
//!
//! A plugin is an executable spawned per session from the plugins
//! directory; its stdin/stdout carry length-delimited JSON frames. The
//! proxy owns the process and its channel exclusively: requests go
//! through an outbound queue, inbound frames are pumped by a reader task
//! onto the owning session's event channel, tagged with a generation
//! counter so events of a replaced worker can be told apart from the
//! current one's.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use signon_types::plugin::{PluginRequest, PluginResponse};

use crate::prelude::*;

/// Events a plugin worker surfaces on its session, tagged with the
/// worker's generation.
#[derive(Debug)]
pub enum ProxyEvent {
	Frame(PluginResponse),
	/// The channel closed: the worker exited or its output broke.
	Exited,
}

pub type ProxyEventSender = mpsc::Sender<(u64, ProxyEvent)>;

pub struct PluginProxy {
	requests: mpsc::Sender<PluginRequest>,
	generation: u64,
	/// Keeps `kill_on_drop` armed: dropping the proxy kills the worker.
	child: Option<tokio::process::Child>,
}

impl std::fmt::Debug for PluginProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PluginProxy").field("generation", &self.generation).finish()
	}
}

impl PluginProxy {
	/// Spawns the worker executable and wires its stdio to the event
	/// channel. The process is killed when the proxy is dropped.
	pub fn spawn(
		executable: &Path,
		generation: u64,
		events: ProxyEventSender,
	) -> SsoResult<Self> {
		let mut child = Command::new(executable)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| {
				warn!("failed to spawn plugin {}: {}", executable.display(), err);
				Error::MethodNotKnown
			})?;
		let stdin = child.stdin.take().ok_or(Error::InternalServer)?;
		let stdout = child.stdout.take().ok_or(Error::InternalServer)?;

		let mut proxy = Self::from_streams(stdout, stdin, generation, events);
		proxy.child = Some(child);
		Ok(proxy)
	}

	/// Builds a proxy over arbitrary streams. Tests drive sessions over
	/// in-memory duplex pipes through this.
	pub fn from_streams<R, W>(
		reader: R,
		writer: W,
		generation: u64,
		events: ProxyEventSender,
	) -> Self
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let (requests, mut request_rx) = mpsc::channel::<PluginRequest>(16);

		let mut sink = FramedWrite::new(writer, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(request) = request_rx.recv().await {
				let frame = match serde_json::to_vec(&request) {
					Ok(frame) => frame,
					Err(err) => {
						warn!("unencodable plugin request: {}", err);
						continue;
					}
				};
				if sink.send(Bytes::from(frame)).await.is_err() {
					break;
				}
			}
		});

		let mut source = FramedRead::new(reader, LengthDelimitedCodec::new());
		tokio::spawn(async move {
			while let Some(frame) = source.next().await {
				let frame = match frame {
					Ok(frame) => frame,
					Err(err) => {
						warn!("plugin channel read failed: {}", err);
						break;
					}
				};
				match serde_json::from_slice::<PluginResponse>(&frame) {
					Ok(response) => {
						if events.send((generation, ProxyEvent::Frame(response))).await.is_err() {
							return;
						}
					}
					Err(err) => {
						warn!("undecodable plugin frame: {}", err);
						break;
					}
				}
			}
			let _ = events.send((generation, ProxyEvent::Exited)).await;
		});

		PluginProxy { requests, generation, child: None }
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub async fn send(&self, request: PluginRequest) -> SsoResult<()> {
		self.requests.send(request).await.map_err(|_| Error::Runtime)
	}
}

/// Creates plugin workers for a session. Injected so tests can supply
/// scripted in-memory plugins.
#[async_trait]
pub trait PluginFactory: Send + Sync + std::fmt::Debug {
	/// Launches a worker for the method, pumping its frames to `events`.
	async fn launch(
		&self,
		method: &str,
		generation: u64,
		events: ProxyEventSender,
	) -> SsoResult<PluginProxy>;

	/// Method names available to sessions.
	async fn methods(&self) -> SsoResult<Vec<Box<str>>>;

	/// Mechanisms a method's plugin implements, asked of the plugin
	/// itself through a transient worker.
	async fn mechanisms(&self, method: &str) -> SsoResult<Vec<Box<str>>>;
}

/// The production factory: one executable per method, named after it,
/// inside the configured plugins directory.
#[derive(Debug)]
pub struct ExecPluginFactory {
	plugins_dir: PathBuf,
}

impl ExecPluginFactory {
	pub fn new(plugins_dir: PathBuf) -> Self {
		ExecPluginFactory { plugins_dir }
	}

	fn executable(&self, method: &str) -> SsoResult<PathBuf> {
		// Method names come from clients; never let them traverse paths.
		if method.is_empty() || method.contains(['/', '\\', '.']) {
			return Err(Error::MethodNotKnown);
		}
		let path = self.plugins_dir.join(method);
		if !path.is_file() {
			return Err(Error::MethodNotKnown);
		}
		Ok(path)
	}
}

#[async_trait]
impl PluginFactory for ExecPluginFactory {
	async fn launch(
		&self,
		method: &str,
		generation: u64,
		events: ProxyEventSender,
	) -> SsoResult<PluginProxy> {
		let executable = self.executable(method)?;
		PluginProxy::spawn(&executable, generation, events)
	}

	async fn methods(&self) -> SsoResult<Vec<Box<str>>> {
		let mut entries = match tokio::fs::read_dir(&self.plugins_dir).await {
			Ok(entries) => entries,
			Err(err) => {
				debug!("plugins dir {} unreadable: {}", self.plugins_dir.display(), err);
				return Ok(Vec::new());
			}
		};
		let mut methods = Vec::new();
		while let Ok(Some(entry)) = entries.next_entry().await {
			let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
			if !is_file {
				continue;
			}
			if let Ok(name) = entry.file_name().into_string() {
				methods.push(name.into_boxed_str());
			}
		}
		methods.sort();
		Ok(methods)
	}

	async fn mechanisms(&self, method: &str) -> SsoResult<Vec<Box<str>>> {
		let (events_tx, mut events_rx) = mpsc::channel(4);
		let proxy = self.launch(method, 0, events_tx).await?;
		proxy.send(PluginRequest::Mechanisms).await?;

		let deadline = tokio::time::Duration::from_secs(5);
		loop {
			let event = tokio::time::timeout(deadline, events_rx.recv())
				.await
				.map_err(|_| Error::MethodNotKnown)?;
			match event {
				Some((_, ProxyEvent::Frame(PluginResponse::MechanismsReply { mechanisms }))) => {
					return Ok(mechanisms);
				}
				Some((_, ProxyEvent::Frame(_))) => continue,
				Some((_, ProxyEvent::Exited)) | None => return Err(Error::MethodNotKnown),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use signon_types::types::SessionData;

	/// Round-trips one frame through in-memory pipes.
	#[tokio::test]
	async fn streams_carry_tagged_frames() {
		let (daemon_io, mut plugin_io) = tokio::io::duplex(4096);
		let (plugin_read, plugin_write) = tokio::io::split(daemon_io);
		let (events_tx, mut events_rx) = mpsc::channel(4);

		let proxy = PluginProxy::from_streams(plugin_read, plugin_write, 3, events_tx);

		// Plugin side: read the request, answer with a result frame.
		let echo = tokio::spawn(async move {
			let (read, write) = tokio::io::split(&mut plugin_io);
			let mut source = FramedRead::new(read, LengthDelimitedCodec::new());
			let frame = source.next().await.expect("frame").expect("intact");
			let request: PluginRequest = serde_json::from_slice(&frame).expect("decodable");
			match request {
				PluginRequest::Process { params, .. } => {
					let mut sink = FramedWrite::new(write, LengthDelimitedCodec::new());
					let reply = PluginResponse::Result { data: params };
					sink.send(Bytes::from(serde_json::to_vec(&reply).expect("encode")))
						.await
						.expect("write");
				}
				other => panic!("unexpected request {:?}", other),
			}
		});

		let mut params = SessionData::new();
		params.insert("UserName".into(), "u".into());
		proxy
			.send(PluginRequest::Process { params, mechanism: "PLAIN".into() })
			.await
			.expect("send");

		let (generation, event) = events_rx.recv().await.expect("event");
		assert_eq!(generation, 3);
		match event {
			ProxyEvent::Frame(PluginResponse::Result { data }) => {
				assert_eq!(data.get("UserName").and_then(|v| v.as_str()), Some("u"));
			}
			other => panic!("unexpected event {:?}", other),
		}
		echo.await.expect("echo task");
	}

	#[tokio::test]
	async fn closed_channel_reports_exit() {
		let (daemon_io, plugin_io) = tokio::io::duplex(4096);
		let (plugin_read, plugin_write) = tokio::io::split(daemon_io);
		let (events_tx, mut events_rx) = mpsc::channel(4);

		let _proxy = PluginProxy::from_streams(plugin_read, plugin_write, 1, events_tx);
		drop(plugin_io);

		let (generation, event) = events_rx.recv().await.expect("event");
		assert_eq!(generation, 1);
		assert!(matches!(event, ProxyEvent::Exited));
	}

	#[tokio::test]
	async fn method_names_cannot_traverse_paths() {
		let factory = ExecPluginFactory::new(PathBuf::from("/nonexistent"));
		assert!(factory.executable("../sh").is_err());
		assert!(factory.executable("").is_err());
	}
}

// vim: ts=4
