//! One peer connection, many streams.
//!
//! Wraps a [`PeerConn`] in a yamux session. The master runs client mode
//! and opens the control stream first; the slave runs server mode and
//! accepts it. Both sides may open and accept data streams afterwards.
//! A driver task owns the yamux state machine and is the only place the
//! underlying connection is polled or closed, which keeps teardown a
//! single-shot operation no matter how many handlers race it.

use std::{
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use futures::future::poll_fn;
use goncat_core::PeerConn;
use snafu::{Backtrace, ResultExt as _, Snafu};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	sync::{Mutex, mpsc, oneshot},
};
use tokio_util::{
	compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
	sync::CancellationToken,
};
use tracing::debug;
use yamux::{Config, Connection, Mode};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MuxError {
	#[snafu(display("multiplexer failure"))]
	Connection {
		source:    yamux::ConnectionError,
		backtrace: Backtrace,
	},
	#[snafu(display("session is closed"))]
	SessionClosed {
		backtrace: Backtrace,
	},
}

/// One logical byte stream of a session, with independent half-close.
pub struct MuxStream(Compat<yamux::Stream>);

impl MuxStream {
	fn new(stream: yamux::Stream) -> Self {
		Self(stream.compat())
	}
}

impl AsyncRead for MuxStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.0).poll_read(cx, buf)
	}
}

impl AsyncWrite for MuxStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.0).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.0).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.0).poll_shutdown(cx)
	}
}

enum Cmd {
	Open {
		reply: oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>,
	},
}

/// Handle to a multiplexed session. Cheap to clone; all clones share the
/// driver task. Cancelling the session token (or losing the peer) ends
/// the driver, which closes the connection exactly once and cancels the
/// token for every borrower.
#[derive(Clone)]
pub struct Session {
	cmd_tx:  mpsc::Sender<Cmd>,
	inbound: Arc<Mutex<mpsc::Receiver<yamux::Stream>>>,
	cancel:  CancellationToken,
}

impl Session {
	/// Master side: stream initiator.
	pub fn client(conn: PeerConn, cancel: CancellationToken) -> Self {
		Self::new(conn, Mode::Client, cancel)
	}

	/// Slave side: stream acceptor.
	pub fn server(conn: PeerConn, cancel: CancellationToken) -> Self {
		Self::new(conn, Mode::Server, cancel)
	}

	fn new(conn: PeerConn, mode: Mode, cancel: CancellationToken) -> Self {
		let mux = Connection::new(conn.compat(), Config::default(), mode);
		let (cmd_tx, cmd_rx) = mpsc::channel(8);
		let (in_tx, in_rx) = mpsc::channel(8);
		tokio::spawn(drive(mux, cmd_rx, in_tx, cancel.clone()));
		Self {
			cmd_tx,
			inbound: Arc::new(Mutex::new(in_rx)),
			cancel,
		}
	}

	/// Open a new outbound stream. Does not block other streams' I/O.
	pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Cmd::Open { reply })
			.await
			.map_err(|_| SessionClosedSnafu.build())?;
		match rx.await {
			Ok(Ok(stream)) => Ok(MuxStream::new(stream)),
			Ok(Err(source)) => Err(source).context(ConnectionSnafu),
			Err(_) => SessionClosedSnafu.fail(),
		}
	}

	/// Wait for the next stream the peer opens.
	pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
		let mut inbound = self.inbound.lock().await;
		tokio::select! {
			_ = self.cancel.cancelled() => SessionClosedSnafu.fail(),
			stream = inbound.recv() => stream.map(MuxStream::new).ok_or_else(|| SessionClosedSnafu.build()),
		}
	}

	pub fn token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Tear the session down; idempotent.
	pub fn close(&self) {
		self.cancel.cancel();
	}
}

enum Event {
	Cmd(Option<Cmd>),
	Inbound(Option<Result<yamux::Stream, yamux::ConnectionError>>),
}

async fn drive(
	mut mux: Connection<Compat<PeerConn>>,
	mut cmd_rx: mpsc::Receiver<Cmd>,
	in_tx: mpsc::Sender<yamux::Stream>,
	cancel: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			_ = cancel.cancelled() => break,
			event = poll_fn(|cx| {
				// Open requests take priority so that job/stream ordering
				// matches the order handlers issued them in.
				if let Poll::Ready(cmd) = cmd_rx.poll_recv(cx) {
					return Poll::Ready(Event::Cmd(cmd));
				}
				mux.poll_next_inbound(cx).map(Event::Inbound)
			}) => event,
		};
		match event {
			Event::Cmd(Some(Cmd::Open { reply })) => {
				let opened = tokio::select! {
					_ = cancel.cancelled() => break,
					res = poll_fn(|cx| mux.poll_new_outbound(cx)) => res,
				};
				let failed = opened.is_err();
				let _ = reply.send(opened);
				if failed {
					break;
				}
			}
			Event::Cmd(None) => break,
			Event::Inbound(Some(Ok(stream))) => {
				if in_tx.send(stream).await.is_err() {
					break;
				}
			}
			Event::Inbound(Some(Err(err))) => {
				debug!(target: "[MUX]", "connection failed: {err}");
				break;
			}
			Event::Inbound(None) => break,
		}
	}
	// Whatever ended the driver ends the session for every borrower.
	cancel.cancel();
	let _ = poll_fn(|cx| mux.poll_close(cx)).await;
	debug!(target: "[MUX]", "session closed");
}

#[cfg(test)]
mod test {
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, duplex};
	use tokio_util::sync::CancellationToken;

	use super::Session;

	fn pair() -> (Session, Session) {
		let (a, b) = duplex(256 * 1024);
		let client = Session::client(Box::new(a), CancellationToken::new());
		let server = Session::server(Box::new(b), CancellationToken::new());
		(client, server)
	}

	#[tokio::test]
	async fn control_stream_first_then_data() -> eyre::Result<()> {
		let (client, server) = pair();

		let mut ctrl_c = client.open_stream().await?;
		ctrl_c.write_all(b"ctrl").await?;
		let mut ctrl_s = server.accept_stream().await?;
		let mut buf = [0u8; 4];
		ctrl_s.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"ctrl");

		// Data streams arrive in open order. Keep ours alive until the
		// peer has read them; dropping a stream resets it.
		let mut held = Vec::new();
		for tag in 0u8..3 {
			let mut out = client.open_stream().await?;
			out.write_all(&[tag]).await?;
			out.flush().await?;
			held.push(out);
		}
		for tag in 0u8..3 {
			let mut got = server.accept_stream().await?;
			let mut one = [0u8; 1];
			got.read_exact(&mut one).await?;
			assert_eq!(one[0], tag);
		}
		Ok(())
	}

	#[tokio::test]
	async fn server_can_open_towards_client() -> eyre::Result<()> {
		let (client, server) = pair();

		// Keep the session busy in the usual direction too.
		let _ctrl = client.open_stream().await?;
		let _ = server.accept_stream().await?;

		let mut from_slave = server.open_stream().await?;
		from_slave.write_all(b"inbound").await?;
		from_slave.flush().await?;

		let mut at_master = client.accept_stream().await?;
		let mut buf = [0u8; 7];
		at_master.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"inbound");
		Ok(())
	}

	#[tokio::test]
	async fn half_close_is_per_direction() -> eyre::Result<()> {
		let (client, server) = pair();

		let mut c = client.open_stream().await?;
		c.write_all(b"ping").await?;
		c.shutdown().await?;

		let mut s = server.accept_stream().await?;
		let mut all = Vec::new();
		s.read_to_end(&mut all).await?;
		assert_eq!(all, b"ping");

		// The reverse direction outlives the forward close.
		s.write_all(b"pong").await?;
		s.shutdown().await?;
		let mut back = Vec::new();
		c.read_to_end(&mut back).await?;
		assert_eq!(back, b"pong");
		Ok(())
	}

	#[tokio::test]
	async fn cancel_tears_everything_down() -> eyre::Result<()> {
		let (client, server) = pair();
		let _ctrl = client.open_stream().await?;
		let _ = server.accept_stream().await?;

		client.close();
		let res = tokio::time::timeout(std::time::Duration::from_secs(2), client.open_stream()).await?;
		assert!(res.is_err());
		Ok(())
	}
}
