//! The slave half of the SOCKS5 proxy: receive the command and target
//! the master negotiated with its local client, dial (or bind), report
//! a verdict byte, then move bytes.

use std::time::Duration;

use bytes::BytesMut;
use eyre::WrapErr as _;
use futures_util::{SinkExt as _, StreamExt as _};
use goncat_core::{pipe::pipe, types::TargetAddr};
use goncat_mux::MuxStream;
use goncat_proto::{
	DatagramCodec,
	socks::{self, Command, Reply},
	try_get_target,
};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::{TcpStream, UdpSocket},
	time::{Instant, sleep_until},
};
use tokio_util::{
	codec::{FramedRead, FramedWrite},
	sync::CancellationToken,
};
use tracing::debug;

use crate::resolve_target;

pub(crate) async fn run(mut stream: MuxStream, timeout: Duration, cancel: CancellationToken) -> eyre::Result<()> {
	let mut cmd = [0u8; 1];
	stream.read_exact(&mut cmd).await.wrap_err("reading proxy command")?;
	match Command::from(cmd[0]) {
		Command::Connect => connect(stream, timeout, cancel).await,
		Command::UdpAssociate => udp_associate(stream, timeout, cancel).await,
		other => {
			debug!(target: "[SOCKS]", "unsupported command {other:?}");
			stream.write_all(&[u8::from(Reply::CommandNotSupported)]).await?;
			Ok(())
		}
	}
}

async fn connect(mut stream: MuxStream, timeout: Duration, cancel: CancellationToken) -> eyre::Result<()> {
	let mut leftover = BytesMut::new();
	let target = read_target(&mut stream, &mut leftover).await?;
	debug!(target: "[SOCKS]", "connect to {target}");

	let dialed = tokio::time::timeout(timeout, async {
		let addr = resolve_target(&target).await?;
		TcpStream::connect(addr).await
	})
	.await;
	let mut conn = match dialed {
		Ok(Ok(conn)) => conn,
		Ok(Err(err)) => {
			debug!(target: "[SOCKS]", "dial {target} failed: {err}");
			stream.write_all(&[u8::from(Reply::for_dial_error(&err))]).await?;
			return Ok(());
		}
		Err(_) => {
			debug!(target: "[SOCKS]", "dial {target} timed out");
			stream.write_all(&[u8::from(Reply::HostUnreachable)]).await?;
			return Ok(());
		}
	};
	let _ = conn.set_nodelay(true);
	stream.write_all(&[u8::from(Reply::Succeeded)]).await?;
	stream.flush().await?;
	// Bytes the client pipelined behind the request belong to the target.
	if !leftover.is_empty() {
		conn.write_all(&leftover).await?;
	}
	pipe(stream, conn, &cancel).await?;
	Ok(())
}

async fn udp_associate(mut stream: MuxStream, idle: Duration, cancel: CancellationToken) -> eyre::Result<()> {
	let socket = match UdpSocket::bind("0.0.0.0:0").await {
		Ok(socket) => socket,
		Err(err) => {
			debug!(target: "[SOCKS]", "cannot bind a udp socket: {err}");
			stream.write_all(&[u8::from(Reply::CommandNotSupported)]).await?;
			return Ok(());
		}
	};
	stream.write_all(&[u8::from(Reply::Succeeded)]).await?;
	stream.flush().await?;

	let (read, write) = tokio::io::split(stream);
	let mut frames_in = FramedRead::new(read, DatagramCodec);
	let mut frames_out = FramedWrite::new(write, DatagramCodec);
	let mut buf = vec![0u8; 65535];
	let deadline = sleep_until(Instant::now() + idle);
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = &mut deadline => break,
			frame = frames_in.next() => match frame {
				Some(Ok(datagram)) => {
					match socks::parse_udp_datagram(&datagram) {
						Ok(relay) => {
							match resolve_target(&relay.target).await {
								Ok(addr) => {
									let _ = socket.send_to(&relay.payload, addr).await;
								}
								Err(err) => debug!(target: "[SOCKS]", "udp target {}: {err}", relay.target),
							}
						}
						Err(err) => debug!(target: "[SOCKS]", "bad relay datagram: {err}"),
					}
					deadline.as_mut().reset(Instant::now() + idle);
				}
				Some(Err(err)) => return Err(err.into()),
				None => break,
			},
			received = socket.recv_from(&mut buf) => {
				let (n, from) = received?;
				let source = match from {
					std::net::SocketAddr::V4(a) => TargetAddr::V4(*a.ip(), a.port()),
					std::net::SocketAddr::V6(a) => TargetAddr::V6(*a.ip(), a.port()),
				};
				let encoded = socks::encode_udp_datagram(&source, &buf[..n])?;
				frames_out.send(encoded).await?;
				deadline.as_mut().reset(Instant::now() + idle);
			}
		}
	}
	Ok(())
}

/// Read one target record off the stream; whatever followed it stays in
/// `leftover` for the caller to forward.
async fn read_target(stream: &mut MuxStream, leftover: &mut BytesMut) -> eyre::Result<TargetAddr> {
	loop {
		if let Some(target) = try_get_target(leftover).wrap_err("malformed target record")? {
			return Ok(target);
		}
		if stream.read_buf(leftover).await? == 0 {
			eyre::bail!("stream closed before a target record arrived");
		}
	}
}
