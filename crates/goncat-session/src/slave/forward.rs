//! Port-forward handlers on the controlled side: dial out for the
//! master's local forwards, bind and notify for its remote forwards.

use std::time::Duration;

use eyre::WrapErr as _;
use goncat_core::{pipe::pipe, types::FwdProto};
use goncat_mux::MuxStream;
use goncat_proto::Job;
use tokio::net::{TcpListener, TcpStream, UdpSocket, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{ControlWriter, udp};

/// `LpfDial`: connect to the requested target and bridge it with the
/// paired stream.
pub(crate) async fn dial_out(
	proto: FwdProto,
	host: String,
	port: u16,
	stream: MuxStream,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	match proto {
		FwdProto::Tcp => {
			let conn = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
				.await
				.wrap_err_with(|| format!("dialing {host}:{port} timed out"))?
				.wrap_err_with(|| format!("dialing {host}:{port}"))?;
			let _ = conn.set_nodelay(true);
			debug!(target: "[LPF]", "bridging to {host}:{port}");
			pipe(stream, conn, &cancel).await?;
			Ok(())
		}
		FwdProto::Udp => {
			let target = lookup_host((host.as_str(), port))
				.await
				.wrap_err_with(|| format!("resolving {host}:{port}"))?
				.next()
				.ok_or_else(|| eyre::eyre!("no address for {host}:{port}"))?;
			let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
			let socket = UdpSocket::bind(local).await.wrap_err("binding forward socket")?;
			socket.connect(target).await.wrap_err_with(|| format!("connecting to {target}"))?;
			debug!(target: "[LPF]", "bridging datagrams to {target}");
			udp::relay_connected(stream, socket, timeout, cancel).await
		}
	}
}

/// `RpfRegister`: bind the requested listener and, per inbound
/// connection, open a stream, notify the master, and bridge.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_remote(
	proto: FwdProto,
	bind_host: String,
	bind_port: u16,
	target_host: String,
	target_port: u16,
	writer: ControlWriter,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let bind_host = if bind_host.is_empty() || bind_host == "*" {
		"0.0.0.0".to_string()
	} else {
		bind_host
	};
	match proto {
		FwdProto::Tcp => {
			let listener = TcpListener::bind((bind_host.as_str(), bind_port))
				.await
				.wrap_err_with(|| format!("binding {bind_host}:{bind_port}"))?;
			info!(target: "[RPF]", "listening on {bind_host}:{bind_port} for {target_host}:{target_port}");
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					accepted = listener.accept() => {
						let (conn, peer) = accepted.wrap_err("accept on remote forward")?;
						let _ = conn.set_nodelay(true);
						debug!(target: "[RPF]", "inbound from {peer}");
						let stream = writer
							.post_with_stream(Job::RpfInbound {
								host: target_host.clone(),
								port: target_port,
							})
							.await?;
						let bridge_cancel = cancel.child_token();
						tokio::spawn(async move {
							if let Err(err) = pipe(conn, stream, &bridge_cancel).await {
								debug!(target: "[RPF]", "bridge for {peer} ended: {err}");
							}
						});
					}
				}
			}
			Ok(())
		}
		FwdProto::Udp => {
			let socket = UdpSocket::bind((bind_host.as_str(), bind_port))
				.await
				.wrap_err_with(|| format!("binding {bind_host}:{bind_port}"))?;
			info!(target: "[RPF]", "listening on {bind_host}:{bind_port}/udp for {target_host}:{target_port}");
			let open = || {
				let writer = writer.clone();
				let target_host = target_host.clone();
				async move {
					writer
						.post_with_stream(Job::RpfInbound {
							host: target_host,
							port: target_port,
						})
						.await
						.map_err(Into::into)
				}
			};
			udp::serve_sessions(socket, open, timeout, cancel).await
		}
	}
}
