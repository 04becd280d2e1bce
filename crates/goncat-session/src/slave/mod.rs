//! Slave session: read jobs, accept their paired streams, spawn
//! handlers. The slave never posts anything on the control stream
//! except `RpfInbound` notifications from registered listeners.

mod forward;
mod shell;
mod socks;

use eyre::WrapErr as _;
use goncat_core::PeerConn;
use goncat_mux::Session;
use goncat_proto::Job;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{MuxSnafu, SessionError, SlaveConfig, UnexpectedJobSnafu, split_control};

/// Run one slave session over an established connection until the peer
/// departs, the session dies, or `cancel` fires. A control-stream
/// protocol violation is an error; everything else is a clean exit.
pub async fn run_slave(conn: PeerConn, cfg: SlaveConfig, cancel: CancellationToken) -> eyre::Result<()> {
	let token = cancel.child_token();
	let session = Session::server(conn, token.clone());
	let ctrl = session
		.accept_stream()
		.await
		.wrap_err("no control stream from the master")?;
	let (mut reader, writer) = split_control(&session, ctrl);
	info!(target: "[SLAVE]", "session established");

	let mut handlers = JoinSet::new();
	let result = loop {
		tokio::select! {
			_ = token.cancelled() => break Ok(()),
			job = reader.next() => match job {
				Ok(Some(job)) => {
					if let Err(err) = dispatch(job, &session, &writer, &cfg, &mut handlers).await {
						break Err(err);
					}
				}
				Ok(None) => {
					debug!(target: "[SLAVE]", "master departed");
					break Ok(());
				}
				Err(err) => break Err(err),
			},
		}
	};

	session.close();
	// Handlers observe the cancelled token and unwind on their own;
	// anything still around after the grace window is aborted.
	let _ = tokio::time::timeout(cfg.timeout, async {
		while handlers.join_next().await.is_some() {}
	})
	.await;
	handlers.shutdown().await;

	result.map_err(Into::into)
}

async fn dispatch(
	job: Job,
	session: &Session,
	writer: &crate::ControlWriter,
	cfg: &SlaveConfig,
	handlers: &mut JoinSet<()>,
) -> Result<(), SessionError> {
	let token = session.token().child_token();
	match job {
		Job::Shell { pty, program } => {
			let data = snafu::ResultExt::context(session.accept_stream().await, MuxSnafu)?;
			if pty {
				let resize = snafu::ResultExt::context(session.accept_stream().await, MuxSnafu)?;
				handlers.spawn(async move {
					if let Err(err) = shell::run_pty(data, resize, program, token).await {
						warn!(target: "[SHELL]", "pty shell refused or failed: {err:#}");
					}
				});
			} else {
				handlers.spawn(async move {
					if let Err(err) = shell::run_plain(data, program, token).await {
						warn!(target: "[SHELL]", "shell failed: {err:#}");
					}
				});
			}
		}
		Job::LpfDial { proto, host, port } => {
			let stream = snafu::ResultExt::context(session.accept_stream().await, MuxSnafu)?;
			let timeout = cfg.timeout;
			handlers.spawn(async move {
				if let Err(err) = forward::dial_out(proto, host, port, stream, timeout, token).await {
					debug!(target: "[LPF]", "forward ended: {err:#}");
				}
			});
		}
		Job::RpfRegister {
			proto,
			bind_host,
			bind_port,
			target_host,
			target_port,
		} => {
			let writer = writer.clone();
			let timeout = cfg.timeout;
			handlers.spawn(async move {
				let res = forward::serve_remote(
					proto,
					bind_host,
					bind_port,
					target_host,
					target_port,
					writer,
					timeout,
					token,
				)
				.await;
				if let Err(err) = res {
					warn!(target: "[RPF]", "remote forward listener ended: {err:#}");
				}
			});
		}
		Job::SocksOpen => {
			let stream = snafu::ResultExt::context(session.accept_stream().await, MuxSnafu)?;
			let timeout = cfg.timeout;
			handlers.spawn(async move {
				if let Err(err) = socks::run(stream, timeout, token).await {
					debug!(target: "[SOCKS]", "proxy stream ended: {err:#}");
				}
			});
		}
		// Resize records belong on their side stream, inbound
		// notifications on the master's control half; seeing either
		// here means the peers disagree about the protocol.
		Job::PtyResize { .. } | Job::RpfInbound { .. } => {
			return UnexpectedJobSnafu { tag: job.tag() }.fail();
		}
	}
	Ok(())
}
