use std::{
	io,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll, ready},
	time::Duration,
};

use bytes::Bytes;
use futures_util::{Sink as _, Stream as _};
use goncat_core::{PeerConn, types::Addr};
use snafu::ResultExt as _;
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{Connector, WebSocketStream, accept_async, connect_async, connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::{
	BindSnafu, CertificateSnafu, ConnHandler, HandshakeSnafu, TransportError, cert::Identity, tls, with_timeout,
};

/// Byte-stream view of a websocket: writes become binary messages, binary
/// messages become readable bytes. Control frames are handled by
/// tungstenite underneath; a Close frame reads as EOF.
#[derive(Debug)]
struct WsByteStream<S> {
	inner:   WebSocketStream<S>,
	readbuf: Bytes,
}

impl<S> WsByteStream<S> {
	fn new(inner: WebSocketStream<S>) -> Self {
		Self {
			inner,
			readbuf: Bytes::new(),
		}
	}
}

fn ws_io_err(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
	match err {
		tokio_tungstenite::tungstenite::Error::ConnectionClosed
		| tokio_tungstenite::tungstenite::Error::AlreadyClosed => io::ErrorKind::BrokenPipe.into(),
		other => io::Error::other(other),
	}
}

impl<S> AsyncRead for WsByteStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if !this.readbuf.is_empty() {
				let n = this.readbuf.len().min(buf.remaining());
				buf.put_slice(&this.readbuf.split_to(n));
				return Poll::Ready(Ok(()));
			}
			match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
				Some(Ok(Message::Binary(data))) => this.readbuf = data,
				Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
				// Ping/pong and stray text frames carry no payload bytes.
				Some(Ok(_)) => continue,
				Some(Err(err)) => return Poll::Ready(Err(ws_io_err(err))),
			}
		}
	}
}

impl<S> AsyncWrite for WsByteStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_err)?;
		Pin::new(&mut this.inner)
			.start_send(Message::Binary(Bytes::copy_from_slice(buf)))
			.map_err(ws_io_err)?;
		Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx).map_err(ws_io_err)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_close(cx).map_err(ws_io_err)
	}
}

pub async fn dial_ws(addr: &Addr, timeout: Duration, secure: bool) -> Result<PeerConn, TransportError> {
	let scheme = if secure { "wss" } else { "ws" };
	let url = format!("{scheme}://{}:{}", addr.host, addr.port);
	with_timeout("websocket connect", timeout, async {
		let stream = if secure {
			let connector = Connector::Rustls(Arc::new(tls::insecure_client_config(Vec::new())));
			let (stream, _) = connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
				.await
				.map_err(|e| HandshakeSnafu { op: "websocket connect", message: e.to_string() }.build())?;
			stream
		} else {
			let (stream, _) = connect_async(url.as_str())
				.await
				.map_err(|e| HandshakeSnafu { op: "websocket connect", message: e.to_string() }.build())?;
			stream
		};
		Ok(Box::new(WsByteStream::new(stream)) as PeerConn)
	})
	.await
}

pub async fn listen_ws<H>(
	addr: &Addr,
	timeout: Duration,
	handler: Arc<H>,
	cancel: CancellationToken,
	secure: bool,
) -> Result<(), TransportError>
where
	H: ConnHandler,
{
	let bind = format!("{}:{}", addr.bind_host(), addr.port);
	let listener = TcpListener::bind(&bind).await.context(BindSnafu { addr: &bind })?;

	// One throwaway identity per listener; peer authentication, when
	// configured, happens in the application TLS layer above.
	let acceptor = if secure {
		let identity = Identity::ephemeral().context(CertificateSnafu)?;
		let config = tls::transport_server_config(identity, Vec::new())?;
		Some(TlsAcceptor::from(Arc::new(config)))
	} else {
		None
	};

	let upgrade = Arc::new(move |stream: TcpStream| {
		let acceptor = acceptor.clone();
		async move {
			with_timeout("websocket accept", timeout, async {
				let _ = stream.set_nodelay(true);
				match acceptor {
					Some(acceptor) => {
						let stream = acceptor
							.accept(stream)
							.await
							.map_err(|e| HandshakeSnafu { op: "tls accept", message: e.to_string() }.build())?;
						let ws = accept_async(stream)
							.await
							.map_err(|e| HandshakeSnafu { op: "websocket accept", message: e.to_string() }.build())?;
						Ok(Box::new(WsByteStream::new(ws)) as PeerConn)
					}
					None => {
						let ws = accept_async(stream)
							.await
							.map_err(|e| HandshakeSnafu { op: "websocket accept", message: e.to_string() }.build())?;
						Ok(Box::new(WsByteStream::new(ws)) as PeerConn)
					}
				}
			})
			.await
		}
	});
	crate::serve_listener(listener, timeout, handler, cancel, upgrade).await
}
