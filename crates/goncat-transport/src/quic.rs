use std::{
	io,
	net::SocketAddr,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use goncat_core::{PeerConn, sem::TimedSemaphore, types::Addr};
use quinn::{Endpoint, EndpointConfig, IdleTimeout, TokioRuntime, TransportConfig, VarInt};
use snafu::ResultExt as _;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	BindSnafu, CertificateSnafu, ConnHandler, HandshakeSnafu, TransportError, cert::Identity, tcp::resolve, tls,
	with_timeout,
};

pub(crate) const ALPN: &[u8] = b"goncat-quic";

/// QUIC streams are lazily materialised: nothing crosses the wire until
/// data flows. The dialer writes this single byte so the listener's
/// `accept_bi` completes and both sides hold a live stream.
const ACTIVATION: u8 = 0;

/// One bidirectional QUIC stream presented as a plain byte stream. Keeps
/// its connection (and the dialer's endpoint) alive for as long as the
/// stream is held.
#[derive(Debug)]
struct QuicStream {
	send:      quinn::SendStream,
	recv:      quinn::RecvStream,
	_conn:     quinn::Connection,
	_endpoint: Option<Endpoint>,
}

impl AsyncRead for QuicStream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.recv).poll_read(cx, buf)
	}
}

impl AsyncWrite for QuicStream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.send).poll_write(cx, buf).map_err(io::Error::other)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.send).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.send).poll_shutdown(cx)
	}
}

/// Keep-alive at a third of the idle budget, idle cut at the full one.
fn transport_config(timeout: Duration) -> Result<TransportConfig, TransportError> {
	let mut config = TransportConfig::default();
	config.keep_alive_interval(Some(timeout / 3));
	config.max_idle_timeout(Some(IdleTimeout::try_from(timeout).map_err(|_| {
		HandshakeSnafu {
			op:      "quic config",
			message: format!("timeout {timeout:?} exceeds the QUIC idle bound"),
		}
		.build()
	})?));
	Ok(config)
}

fn bind_udp_reuse(addr: SocketAddr) -> Result<std::net::UdpSocket, TransportError> {
	let bind = |addr: SocketAddr| -> io::Result<std::net::UdpSocket> {
		let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
		socket.set_reuse_address(true)?;
		socket.bind(&addr.into())?;
		Ok(socket.into())
	};
	bind(addr).context(BindSnafu { addr: addr.to_string() })
}

pub async fn dial_quic(addr: &Addr, timeout: Duration) -> Result<PeerConn, TransportError> {
	tls::init_crypto();
	let authority = addr.authority();
	let host = addr.host.clone();
	with_timeout("quic connect", timeout, async move {
		let target = resolve(&authority).await?;
		let local: SocketAddr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().expect("fixed");
		let socket = std::net::UdpSocket::bind(local).context(BindSnafu { addr: local.to_string() })?;

		let crypto = tls::insecure_client_config(vec![ALPN.to_vec()]);
		let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
			.map_err(|e| HandshakeSnafu { op: "quic config", message: e.to_string() }.build())?;
		let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
		client_config.transport_config(Arc::new(transport_config(timeout)?));

		let mut endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))
			.map_err(|e| HandshakeSnafu { op: "quic endpoint", message: e.to_string() }.build())?;
		endpoint.set_default_client_config(client_config);

		let conn = endpoint
			.connect(target, &host)
			.map_err(|e| HandshakeSnafu { op: "quic connect", message: e.to_string() }.build())?
			.await
			.map_err(|e| HandshakeSnafu { op: "quic connect", message: e.to_string() }.build())?;
		let (mut send, recv) = conn
			.open_bi()
			.await
			.map_err(|e| HandshakeSnafu { op: "quic stream", message: e.to_string() }.build())?;
		send.write_all(&[ACTIVATION])
			.await
			.map_err(|e| HandshakeSnafu { op: "quic activation", message: e.to_string() }.build())?;
		debug!(target: "[QUIC]", "connected to {target}");
		Ok(Box::new(QuicStream {
			send,
			recv,
			_conn: conn,
			_endpoint: Some(endpoint),
		}) as PeerConn)
	})
	.await
}

pub async fn listen_quic<H>(
	addr: &Addr,
	timeout: Duration,
	handler: Arc<H>,
	cancel: CancellationToken,
) -> Result<(), TransportError>
where
	H: ConnHandler,
{
	tls::init_crypto();
	let bind_authority = format!("{}:{}", addr.bind_host(), addr.port);
	let bind_addr = resolve(&bind_authority).await?;
	let socket = bind_udp_reuse(bind_addr)?;

	let identity = Identity::ephemeral().context(CertificateSnafu)?;
	let crypto = tls::transport_server_config(identity, vec![ALPN.to_vec()])?;
	let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
		.map_err(|e| HandshakeSnafu { op: "quic config", message: e.to_string() }.build())?;
	let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
	server_config.transport_config(Arc::new(transport_config(timeout)?));

	let endpoint = Endpoint::new(EndpointConfig::default(), Some(server_config), socket, Arc::new(TokioRuntime))
		.map_err(|e| HandshakeSnafu { op: "quic endpoint", message: e.to_string() }.build())?;
	info!(target: "[QUIC]", "listening on {}", bind_addr);

	let conn_slots = TimedSemaphore::new(crate::MAX_CONNECTIONS, timeout);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			incoming = endpoint.accept() => {
				let Some(incoming) = incoming else { break };
				let Some(permit) = conn_slots.try_acquire() else {
					debug!(target: "[QUIC]", "refusing {}: connection limit reached", incoming.remote_address());
					incoming.refuse();
					continue;
				};
				let handler = handler.clone();
				tokio::spawn(async move {
					let _permit = permit;
					let peer = incoming.remote_address();
					match accept_quic(incoming, timeout).await {
						Ok(conn) => {
							if let Err(err) = handler.handle(conn).await {
								warn!(target: "[QUIC]", "connection from {peer} ended with error: {err:#}");
							}
						}
						Err(err) => warn!(target: "[QUIC]", "connection from {peer} not established: {err}"),
					}
				});
			}
		}
	}
	endpoint.close(VarInt::from_u32(0), b"shutdown");
	debug!(target: "[QUIC]", "listener shut down");
	Ok(())
}

async fn accept_quic(incoming: quinn::Incoming, timeout: Duration) -> Result<PeerConn, TransportError> {
	let connecting = incoming
		.accept()
		.map_err(|e| HandshakeSnafu { op: "quic accept", message: e.to_string() }.build())?;
	let conn = with_timeout("quic accept", timeout, async {
		connecting
			.await
			.map_err(|e| HandshakeSnafu { op: "quic accept", message: e.to_string() }.build())
	})
	.await?;
	let (send, recv) = with_timeout("quic stream accept", timeout, async {
		conn.accept_bi()
			.await
			.map_err(|e| HandshakeSnafu { op: "quic stream accept", message: e.to_string() }.build())
	})
	.await?;
	let mut stream = QuicStream {
		send,
		recv,
		_conn: conn,
		_endpoint: None,
	};
	with_timeout("quic activation", timeout, async {
		let mut one = [0u8; 1];
		stream
			.read_exact(&mut one)
			.await
			.map_err(|e| HandshakeSnafu { op: "quic activation", message: e.to_string() }.build())?;
		Ok(())
	})
	.await?;
	Ok(Box::new(stream))
}
