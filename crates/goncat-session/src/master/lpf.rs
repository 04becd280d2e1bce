//! Local port forwarding: the master binds, the slave dials.

use std::time::Duration;

use eyre::WrapErr as _;
use goncat_core::{pipe::pipe, types::{ForwardSpec, FwdProto}};
use goncat_proto::Job;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{ControlWriter, udp};

pub(crate) async fn serve_local(
	spec: ForwardSpec,
	writer: ControlWriter,
	timeout: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let bind = (spec.bind_host_or_all(), spec.bind_port);
	match spec.proto {
		FwdProto::Tcp => {
			let listener = TcpListener::bind(bind)
				.await
				.wrap_err_with(|| format!("binding {}:{}", bind.0, bind.1))?;
			info!(target: "[LPF]", "forwarding {}:{} -> {}:{}", bind.0, bind.1, spec.target_host, spec.target_port);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					accepted = listener.accept() => {
						let (conn, peer) = accepted.wrap_err("accept on local forward")?;
						let _ = conn.set_nodelay(true);
						debug!(target: "[LPF]", "client {peer}");
						let stream = writer
							.post_with_stream(Job::LpfDial {
								proto: FwdProto::Tcp,
								host:  spec.target_host.clone(),
								port:  spec.target_port,
							})
							.await?;
						let bridge_cancel = cancel.child_token();
						tokio::spawn(async move {
							if let Err(err) = pipe(conn, stream, &bridge_cancel).await {
								debug!(target: "[LPF]", "bridge for {peer} ended: {err}");
							}
						});
					}
				}
			}
			Ok(())
		}
		FwdProto::Udp => {
			let socket = UdpSocket::bind(bind)
				.await
				.wrap_err_with(|| format!("binding {}:{}", bind.0, bind.1))?;
			info!(target: "[LPF]", "forwarding {}:{}/udp -> {}:{}", bind.0, bind.1, spec.target_host, spec.target_port);
			let open = || {
				let writer = writer.clone();
				let host = spec.target_host.clone();
				let port = spec.target_port;
				async move {
					writer
						.post_with_stream(Job::LpfDial {
							proto: FwdProto::Udp,
							host,
							port,
						})
						.await
						.map_err(Into::into)
				}
			};
			udp::serve_sessions(socket, open, timeout, cancel).await
		}
	}
}
