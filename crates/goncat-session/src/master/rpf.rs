//! The master half of remote forwarding: dial the registered target for
//! each allow-listed inbound. Failures here are contained: the stream
//! closes, the slave's listener and the session stay up.

use std::time::Duration;

use goncat_core::{pipe::pipe, types::FwdProto};
use goncat_mux::MuxStream;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::udp;

pub(crate) async fn bridge_inbound(
	proto: FwdProto,
	host: String,
	port: u16,
	stream: MuxStream,
	timeout: Duration,
	cancel: CancellationToken,
) {
	match proto {
		FwdProto::Tcp => {
			let dialed = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await;
			let conn = match dialed {
				Ok(Ok(conn)) => conn,
				Ok(Err(err)) => {
					warn!(target: "[RPF]", "cannot dial {host}:{port}: {err}");
					return;
				}
				Err(_) => {
					warn!(target: "[RPF]", "dial {host}:{port} timed out");
					return;
				}
			};
			let _ = conn.set_nodelay(true);
			if let Err(err) = pipe(stream, conn, &cancel).await {
				debug!(target: "[RPF]", "bridge to {host}:{port} ended: {err}");
			}
		}
		FwdProto::Udp => {
			let bridged = async {
				let target = lookup_host((host.as_str(), port))
					.await?
					.next()
					.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
				let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
				let socket = UdpSocket::bind(local).await?;
				socket.connect(target).await?;
				Ok::<UdpSocket, std::io::Error>(socket)
			};
			let socket = match bridged.await {
				Ok(socket) => socket,
				Err(err) => {
					warn!(target: "[RPF]", "cannot reach {host}:{port}/udp: {err}");
					return;
				}
			};
			if let Err(err) = udp::relay_connected(stream, socket, timeout, cancel).await {
				debug!(target: "[RPF]", "datagram bridge to {host}:{port} ended: {err:#}");
			}
		}
	}
}
