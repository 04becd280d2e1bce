//! Master session: post jobs, serve the operator's listeners (local
//! forwards, SOCKS), bridge remote-forward inbounds after checking the
//! allow-list, and run the interactive shell when one is configured.

mod lpf;
mod rpf;
mod shell;
mod socks;

pub use shell::OperatorIo;

use std::sync::Arc;

use eyre::WrapErr as _;
use goncat_core::{PeerConn, sem::TimedSemaphore};
use goncat_mux::Session;
use goncat_proto::Job;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AllowList, MasterConfig, MuxSnafu, UnexpectedJobSnafu, split_control};

/// Run one master session over an established connection.
///
/// Returns when the interactive shell finishes (when one is configured),
/// when the peer departs, or on cancellation; a control-stream protocol
/// violation is the only error path that matters.
pub async fn run_master(
	conn: PeerConn,
	cfg: Arc<MasterConfig>,
	io: OperatorIo,
	stdio_sem: TimedSemaphore,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let token = cancel.child_token();
	let session = Session::client(conn, token.clone());
	let ctrl = snafu::ResultExt::context(session.open_stream().await, MuxSnafu).wrap_err("opening the control stream")?;
	let (mut reader, writer) = split_control(&session, ctrl);
	let allow = AllowList::from_forwards(&cfg.remote_forwards);
	info!(target: "[MASTER]", "session established");

	let mut services = JoinSet::new();

	// Remote forwards are registered up front; the slave binds and the
	// inbound notifications come back on the control stream.
	for spec in &cfg.remote_forwards {
		writer
			.post(Job::RpfRegister {
				proto:       spec.proto,
				bind_host:   spec.bind_host.clone().unwrap_or_default(),
				bind_port:   spec.bind_port,
				target_host: spec.target_host.clone(),
				target_port: spec.target_port,
			})
			.await
			.wrap_err("registering remote forward")?;
	}
	for spec in &cfg.local_forwards {
		let spec = spec.clone();
		let writer = writer.clone();
		let timeout = cfg.timeout;
		let child = token.child_token();
		services.spawn(async move {
			if let Err(err) = lpf::serve_local(spec, writer, timeout, child).await {
				warn!(target: "[LPF]", "local forward ended: {err:#}");
			}
		});
	}
	if let Some(spec) = &cfg.socks {
		let spec = spec.clone();
		let writer = writer.clone();
		let timeout = cfg.timeout;
		let child = token.child_token();
		services.spawn(async move {
			if let Err(err) = socks::serve(spec, writer, timeout, child).await {
				warn!(target: "[SOCKS]", "proxy listener ended: {err:#}");
			}
		});
	}

	let mut shell_task = cfg.exec.clone().map(|program| {
		tokio::spawn(shell::run(
			program,
			cfg.pty,
			cfg.log_file.clone(),
			io,
			writer.clone(),
			stdio_sem,
			token.child_token(),
		))
	});

	let result = loop {
		tokio::select! {
			_ = token.cancelled() => break Ok(()),
			// The interactive part of the session is the session: once
			// the operator is done, tear everything down.
			done = async { shell_task.as_mut().expect("guarded by branch condition").await }, if shell_task.is_some() => {
				shell_task = None;
				match done {
					Ok(res) => break res,
					Err(err) => break Err(eyre::eyre!("shell handler panicked: {err}")),
				}
			}
			job = reader.next() => match job {
				Ok(Some(Job::RpfInbound { host, port })) => {
					let stream = snafu::ResultExt::context(session.accept_stream().await, MuxSnafu)?;
					match allow.permits(&host, port) {
						Some(proto) => {
							let timeout = cfg.timeout;
							let child = token.child_token();
							services.spawn(async move {
								rpf::bridge_inbound(proto, host, port, stream, timeout, child).await;
							});
						}
						None => {
							warn!(target: "[RPF]", "refusing inbound for unlisted target {host}:{port}");
							drop(stream);
						}
					}
				}
				Ok(Some(job)) => break Err(UnexpectedJobSnafu { tag: job.tag() }.build().into()),
				Ok(None) => {
					debug!(target: "[MASTER]", "slave departed");
					break Ok(());
				}
				Err(err) => break Err(err.into()),
			},
		}
	};

	session.close();
	if let Some(task) = shell_task {
		task.abort();
	}
	let _ = tokio::time::timeout(cfg.timeout, async {
		while services.join_next().await.is_some() {}
	})
	.await;
	services.shutdown().await;

	result
}
