//! The operator half of the shell: stdio piping, raw terminal mode,
//! window-size propagation and the optional transcript.

use std::path::PathBuf;

use eyre::WrapErr as _;
use futures_util::SinkExt as _;
use goncat_core::{pipe::copy_tee, sem::TimedSemaphore};
use goncat_mux::MuxStream;
use goncat_proto::{Job, JobCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::ControlWriter;

/// Where the session's interactive bytes go. The binary wires the real
/// stdio; tests inject pipe halves.
pub struct OperatorIo {
	pub input:        Box<dyn AsyncRead + Send + Unpin>,
	pub output:       Box<dyn AsyncWrite + Send + Unpin>,
	/// Toggle raw mode and watch for window-size changes; only set when
	/// the output is a real terminal.
	pub raw_terminal: bool,
}

/// Restores the terminal no matter how the shell ends.
struct RawModeGuard;

impl RawModeGuard {
	fn enable() -> Option<Self> {
		match crossterm::terminal::enable_raw_mode() {
			Ok(()) => Some(Self),
			Err(err) => {
				warn!(target: "[SHELL]", "cannot enter raw mode: {err}");
				None
			}
		}
	}
}

impl Drop for RawModeGuard {
	fn drop(&mut self) {
		let _ = crossterm::terminal::disable_raw_mode();
	}
}

pub(crate) async fn run(
	program: String,
	pty: bool,
	log_file: Option<PathBuf>,
	io: OperatorIo,
	writer: ControlWriter,
	stdio_sem: TimedSemaphore,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	// The operator's stdio fits one shell at a time; a refusal leaves
	// the rest of the session alone.
	let _permit = match stdio_sem.acquire(&cancel).await {
		Ok(permit) => permit,
		Err(err) => {
			warn!(target: "[SHELL]", "refusing shell job: {err}");
			return Ok(());
		}
	};

	let (data, resize) = if pty {
		let (data, resize) = writer.post_pty_shell(Some(program.clone())).await?;
		(data, Some(resize))
	} else {
		let data = writer
			.post_with_stream(Job::Shell {
				pty:     false,
				program: Some(program.clone()),
			})
			.await?;
		(data, None)
	};
	info!(target: "[SHELL]", "requested {program} (pty: {pty})");

	let _raw = (pty && io.raw_terminal).then(RawModeGuard::enable).flatten();
	let _resize_task = resize.map(|stream| {
		let watch = io.raw_terminal;
		let child = cancel.child_token();
		tokio::spawn(resize_loop(stream, watch, child))
	});

	pipe_stdio(data, io, log_file, cancel).await
}

/// Send the current window size, then one update per SIGWINCH. The
/// stream stays open for the pty's lifetime even where no size signal
/// exists.
async fn resize_loop(stream: MuxStream, watch: bool, cancel: CancellationToken) {
	let mut frames = FramedWrite::new(stream, JobCodec);
	let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
	if let Err(err) = frames.send(Job::PtyResize { cols, rows }).await {
		debug!(target: "[SHELL]", "resize stream broke: {err}");
		return;
	}

	#[cfg(unix)]
	if watch {
		let mut winch = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
			Ok(winch) => winch,
			Err(err) => {
				warn!(target: "[SHELL]", "cannot watch window size: {err}");
				cancel.cancelled().await;
				return;
			}
		};
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				changed = winch.recv() => {
					if changed.is_none() {
						return;
					}
					let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
					debug!(target: "[SHELL]", "window now {cols}x{rows}");
					if frames.send(Job::PtyResize { cols, rows }).await.is_err() {
						return;
					}
				}
			}
		}
	}

	let _ = watch;
	cancel.cancelled().await;
}

/// Pipe operator stdio against the data stream. Returns when the remote
/// side is done. The operator's stdin may never see EOF, so only the
/// remote-to-operator direction decides completion.
async fn pipe_stdio(
	stream: MuxStream,
	io: OperatorIo,
	log_file: Option<PathBuf>,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let transcript = match &log_file {
		Some(path) => Some(
			tokio::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.await
				.wrap_err_with(|| format!("opening transcript {}", path.display()))?,
		),
		None => None,
	};

	let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
	let mut input = io.input;
	let mut output = io.output;

	let to_remote = async {
		let res = tokio::io::copy(&mut input, &mut stream_wr).await;
		let _ = stream_wr.shutdown().await;
		res
	};
	let from_remote = async {
		let res = match transcript {
			Some(mut file) => copy_tee(&mut stream_rd, &mut output, &mut file).await,
			None => {
				let n = tokio::io::copy(&mut stream_rd, &mut output).await;
				let _ = output.flush().await;
				n
			}
		};
		res
	};
	tokio::pin!(to_remote);
	tokio::pin!(from_remote);

	let mut input_done = false;
	loop {
		tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			res = &mut from_remote => {
				res.wrap_err("reading from the remote shell")?;
				return Ok(());
			}
			res = &mut to_remote, if !input_done => {
				input_done = true;
				if let Err(err) = res {
					debug!(target: "[SHELL]", "operator input ended: {err}");
				}
			}
		}
	}
}
