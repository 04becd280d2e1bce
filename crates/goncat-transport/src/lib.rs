//! Peer connection establishment over tcp, ws, wss and udp (QUIC).
//!
//! Free functions per transport, selected by the `Proto` variant of the
//! configured address. Whatever the transport, the result is one
//! `PeerConn` byte stream; the session layer above never learns which
//! transport produced it.

mod error;
pub use error::*;

pub mod cert;
pub mod tls;

mod tcp;
pub use tcp::{dial_tcp, listen_tcp};
mod ws;
pub use ws::{dial_ws, listen_ws};
mod quic;
pub use quic::{dial_quic, listen_quic};

use std::{sync::Arc, time::Duration};

use goncat_core::{
	PeerConn,
	sem::TimedSemaphore,
	types::{Addr, Proto},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard cap on live connections per listener; surplus accepts are
/// dropped on the floor, which closes them immediately.
pub const MAX_CONNECTIONS: usize = 100;

/// Per-connection entry point of a listener. Runs on its own task.
pub trait ConnHandler: Send + Sync + 'static {
	fn handle(&self, conn: PeerConn) -> impl Future<Output = eyre::Result<()>> + Send;
}

/// Establish a connection to `addr` within `timeout`.
pub async fn dial(addr: &Addr, timeout: Duration) -> Result<PeerConn, TransportError> {
	match addr.proto {
		Proto::Tcp => dial_tcp(addr, timeout).await,
		Proto::Ws => dial_ws(addr, timeout, false).await,
		Proto::Wss => dial_ws(addr, timeout, true).await,
		Proto::Udp => dial_quic(addr, timeout).await,
	}
}

/// Accept connections on `addr` and run `handler` for each until the
/// token fires. Returns only on cancellation or a bind-time failure;
/// the listener is closed by the time this returns.
pub async fn listen_and_serve<H>(
	addr: &Addr,
	timeout: Duration,
	handler: Arc<H>,
	cancel: CancellationToken,
) -> Result<(), TransportError>
where
	H: ConnHandler,
{
	match addr.proto {
		Proto::Tcp => listen_tcp(addr, timeout, handler, cancel).await,
		Proto::Ws => listen_ws(addr, timeout, handler, cancel, false).await,
		Proto::Wss => listen_ws(addr, timeout, handler, cancel, true).await,
		Proto::Udp => listen_quic(addr, timeout, handler, cancel).await,
	}
}

/// Accept loop shared by the TCP-based listeners. `upgrade` turns the
/// raw socket into the final byte stream (no-op for plain tcp, the
/// TLS/websocket handshakes for ws and wss) and runs on the connection's
/// task so a slow handshake never stalls the loop.
pub(crate) async fn serve_listener<H, U, Fut>(
	listener: TcpListener,
	timeout: Duration,
	handler: Arc<H>,
	cancel: CancellationToken,
	upgrade: Arc<U>,
) -> Result<(), TransportError>
where
	H: ConnHandler,
	U: Fn(TcpStream) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<PeerConn, TransportError>> + Send + 'static,
{
	if let Ok(local) = listener.local_addr() {
		info!(target: "[LISTEN]", "listening on {local}");
	}
	let conn_slots = TimedSemaphore::new(MAX_CONNECTIONS, timeout);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(err) => {
						warn!(target: "[LISTEN]", "accept failed: {err}");
						continue;
					}
				};
				let Some(permit) = conn_slots.try_acquire() else {
					debug!(target: "[LISTEN]", "dropping {peer}: connection limit reached");
					continue;
				};
				let handler = handler.clone();
				let upgrade = upgrade.clone();
				tokio::spawn(async move {
					let _permit = permit;
					let conn = match upgrade(stream).await {
						Ok(conn) => conn,
						Err(err) => {
							warn!(target: "[LISTEN]", "connection from {peer} not established: {err}");
							return;
						}
					};
					if let Err(err) = handler.handle(conn).await {
						warn!(target: "[LISTEN]", "connection from {peer} ended with error: {err:#}");
					}
				});
			}
		}
	}
	debug!(target: "[LISTEN]", "listener shut down");
	Ok(())
}
