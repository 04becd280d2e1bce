//! The master half of the SOCKS5 proxy: speak RFC 1928 with the local
//! client, forward the selected target to the slave, translate its
//! verdict into the client-facing reply, then move bytes.

use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use eyre::WrapErr as _;
use futures_util::{SinkExt as _, StreamExt as _};
use goncat_core::{pipe::pipe, types::SocksSpec};
use goncat_mux::MuxStream;
use goncat_proto::{
	DatagramCodec, Job, put_target,
	socks::{self, Command, Reply},
};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::{TcpListener, TcpStream, UdpSocket},
	time::{Instant, sleep_until},
};
use tokio_util::{
	codec::{FramedRead, FramedWrite},
	sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::ControlWriter;

pub(crate) async fn serve(
	spec: SocksSpec,
	writer: ControlWriter,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let listener = TcpListener::bind((spec.host.as_str(), spec.port))
		.await
		.wrap_err_with(|| format!("binding socks listener {spec}"))?;
	info!(target: "[SOCKS]", "proxy listening on {spec}");
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => {
				let (client, peer) = accepted.wrap_err("accept on socks listener")?;
				let writer = writer.clone();
				let child = cancel.child_token();
				tokio::spawn(async move {
					if let Err(err) = handle_client(client, writer, timeout, child).await {
						debug!(target: "[SOCKS]", "client {peer} ended: {err:#}");
					}
				});
			}
		}
	}
	Ok(())
}

async fn handle_client(
	mut client: TcpStream,
	writer: ControlWriter,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let _ = client.set_nodelay(true);
	socks::accept_no_auth(&mut client).await?;
	let (cmd, target) = socks::read_request(&mut client).await?;
	let local = client.local_addr().wrap_err("socks local addr")?;

	match cmd {
		Command::Connect => {
			debug!(target: "[SOCKS]", "CONNECT {target}");
			let mut stream = writer.post_with_stream(Job::SocksOpen).await?;
			let mut head = BytesMut::with_capacity(1 + 19);
			head.extend_from_slice(&[u8::from(Command::Connect)]);
			put_target(&mut head, &target)?;
			stream.write_all(&head).await?;
			stream.flush().await?;

			let verdict = read_verdict(&mut stream, timeout).await?;
			socks::write_reply(&mut client, verdict, local).await?;
			if verdict == Reply::Succeeded {
				pipe(client, stream, &cancel).await?;
			}
		}
		Command::UdpAssociate => {
			debug!(target: "[SOCKS]", "UDP ASSOCIATE from {target}");
			let mut stream = writer.post_with_stream(Job::SocksOpen).await?;
			stream.write_all(&[u8::from(Command::UdpAssociate)]).await?;
			stream.flush().await?;

			let verdict = read_verdict(&mut stream, timeout).await?;
			if verdict != Reply::Succeeded {
				socks::write_reply(&mut client, verdict, local).await?;
				return Ok(());
			}
			// The relay socket lives where the client reached us.
			let relay = match UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await {
				Ok(relay) => relay,
				Err(err) => {
					warn!(target: "[SOCKS]", "cannot bind relay socket: {err}");
					socks::write_reply(&mut client, Reply::GeneralFailure, local).await?;
					return Ok(());
				}
			};
			let relay_addr = relay.local_addr()?;
			socks::write_reply(&mut client, Reply::Succeeded, relay_addr).await?;
			relay_udp(client, relay, stream, timeout, cancel).await?;
		}
		other => {
			debug!(target: "[SOCKS]", "unsupported command {other:?}");
			socks::write_reply(&mut client, Reply::CommandNotSupported, local).await?;
		}
	}
	Ok(())
}

async fn read_verdict(stream: &mut MuxStream, timeout: Duration) -> eyre::Result<Reply> {
	let mut verdict = [0u8; 1];
	tokio::time::timeout(timeout, stream.read_exact(&mut verdict))
		.await
		.wrap_err("waiting for the slave's verdict")??;
	Ok(Reply::from(verdict[0]))
}

/// Shovel SOCKS-UDP datagrams (headers intact) between the client's
/// relay socket and the framed stream. The association lives as long as
/// the client's TCP connection, per RFC 1928.
async fn relay_udp(
	mut client: TcpStream,
	relay: UdpSocket,
	stream: MuxStream,
	idle: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let (read, write) = tokio::io::split(stream);
	let mut frames_in = FramedRead::new(read, DatagramCodec);
	let mut frames_out = FramedWrite::new(write, DatagramCodec);
	let mut buf = vec![0u8; 65535];
	let mut tcp_probe = [0u8; 1];
	let mut client_addr: Option<SocketAddr> = None;
	let deadline = sleep_until(Instant::now() + idle);
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = &mut deadline => break,
			// EOF on the controlling TCP connection ends the association.
			probed = client.read(&mut tcp_probe) => match probed {
				Ok(0) | Err(_) => break,
				Ok(_) => {}
			},
			received = relay.recv_from(&mut buf) => {
				let (n, from) = received?;
				// First datagram pins the client; everything else is noise.
				match client_addr {
					None => client_addr = Some(from),
					Some(addr) if addr != from => continue,
					Some(_) => {}
				}
				frames_out.send(bytes::Bytes::copy_from_slice(&buf[..n])).await?;
				deadline.as_mut().reset(Instant::now() + idle);
			}
			frame = frames_in.next() => match frame {
				Some(Ok(datagram)) => {
					if let Some(addr) = client_addr {
						let _ = relay.send_to(&datagram, addr).await;
					}
					deadline.as_mut().reset(Instant::now() + idle);
				}
				Some(Err(err)) => return Err(err.into()),
				None => break,
			},
		}
	}
	Ok(())
}
