use std::{net::SocketAddr, sync::Arc, time::Duration};

use goncat_core::{PeerConn, types::Addr};
use snafu::ResultExt as _;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio_util::sync::CancellationToken;

use crate::{BindSnafu, ConnHandler, DialSnafu, NoAddressSnafu, ResolveSnafu, TransportError, with_timeout};

pub(crate) async fn resolve(authority: &str) -> Result<SocketAddr, TransportError> {
	let mut addrs = lookup_host(authority).await.context(ResolveSnafu { authority })?;
	addrs.next().ok_or_else(|| NoAddressSnafu { authority }.build())
}

pub async fn dial_tcp(addr: &Addr, timeout: Duration) -> Result<PeerConn, TransportError> {
	let authority = addr.authority();
	let stream = with_timeout("tcp connect", timeout, async {
		let target = resolve(&authority).await?;
		TcpStream::connect(target).await.context(DialSnafu { authority: &authority })
	})
	.await?;
	let _ = stream.set_nodelay(true);
	Ok(Box::new(stream))
}

pub async fn listen_tcp<H>(
	addr: &Addr,
	timeout: Duration,
	handler: Arc<H>,
	cancel: CancellationToken,
) -> Result<(), TransportError>
where
	H: ConnHandler,
{
	let bind = format!("{}:{}", addr.bind_host(), addr.port);
	let listener = TcpListener::bind(&bind).await.context(BindSnafu { addr: &bind })?;
	let upgrade = Arc::new(|stream: TcpStream| async move {
		let _ = stream.set_nodelay(true);
		Ok(Box::new(stream) as PeerConn)
	});
	crate::serve_listener(listener, timeout, handler, cancel, upgrade).await
}
