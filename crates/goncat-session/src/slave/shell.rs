//! Shell execution on the controlled side.

use std::process::Stdio;

use bytes::Bytes;
use eyre::WrapErr as _;
use futures_util::StreamExt as _;
use goncat_mux::MuxStream;
use goncat_proto::{Job, JobCodec};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	process::Command,
	sync::{mpsc, oneshot},
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 16 * 1024;

pub(crate) fn default_shell() -> &'static str {
	if cfg!(windows) { "cmd.exe" } else { "/bin/sh" }
}

/// Plain shell: pipes for stdio, stdout and stderr merged onto the
/// stream. Returns once the program has exited *and* the I/O has
/// drained; a broken stream kills the program instead of orphaning it.
pub(crate) async fn run_plain(
	stream: MuxStream,
	program: Option<String>,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let program = program.unwrap_or_else(|| default_shell().to_string());
	let mut child = Command::new(&program)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.wrap_err_with(|| format!("failed to spawn {program}"))?;
	info!(target: "[SHELL]", "spawned {program} (pid {:?})", child.id());

	let mut stdin = child.stdin.take().expect("stdin piped");
	let mut stdout = child.stdout.take().expect("stdout piped");
	let mut stderr = child.stderr.take().expect("stderr piped");
	let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);

	let io_task = async {
		let to_child = async {
			let res = tokio::io::copy(&mut stream_rd, &mut stdin).await;
			// EOF from the operator half-closes the child's stdin.
			drop(stdin);
			res.map(|_| ())
		};
		let from_child = async {
			let mut out_buf = [0u8; BUFFER_SIZE];
			let mut err_buf = [0u8; BUFFER_SIZE];
			let mut out_open = true;
			let mut err_open = true;
			while out_open || err_open {
				tokio::select! {
					read = stdout.read(&mut out_buf), if out_open => match read? {
						0 => out_open = false,
						n => {
							stream_wr.write_all(&out_buf[..n]).await?;
							stream_wr.flush().await?;
						}
					},
					read = stderr.read(&mut err_buf), if err_open => match read? {
						0 => err_open = false,
						n => {
							stream_wr.write_all(&err_buf[..n]).await?;
							stream_wr.flush().await?;
						}
					},
				}
			}
			let _ = stream_wr.shutdown().await;
			Ok::<(), std::io::Error>(())
		};
		tokio::try_join!(to_child, from_child).map(|_| ())
	};
	tokio::pin!(io_task);

	let mut io_done = false;
	let mut exit = None;
	while !(io_done && exit.is_some()) {
		tokio::select! {
			_ = cancel.cancelled() => {
				let _ = child.start_kill();
				let _ = child.wait().await;
				return Ok(());
			}
			res = &mut io_task, if !io_done => {
				io_done = true;
				if let Err(err) = res {
					debug!(target: "[SHELL]", "stream failed, killing {program}: {err}");
					let _ = child.start_kill();
				}
			}
			status = child.wait(), if exit.is_none() => {
				exit = Some(status.wrap_err("wait on child")?);
			}
		}
	}
	info!(target: "[SHELL]", "{program} exited with {}", exit.expect("loop sets exit"));
	Ok(())
}

/// PTY shell: the program runs as the session leader of a fresh
/// pseudo-terminal, the pty master is bridged onto the stream, and a
/// second stream delivers window-size updates. If the platform cannot
/// allocate a pty the job is refused by dropping both streams.
pub(crate) async fn run_pty(
	stream: MuxStream,
	resize: MuxStream,
	program: Option<String>,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let program = program.unwrap_or_else(|| default_shell().to_string());
	let pty = native_pty_system();
	let pair = pty
		.openpty(PtySize {
			rows:         24,
			cols:         80,
			pixel_width:  0,
			pixel_height: 0,
		})
		.map_err(|err| eyre::eyre!("pty allocation failed: {err}"))?;
	let mut child = pair
		.slave
		.spawn_command(CommandBuilder::new(&program))
		.map_err(|err| eyre::eyre!("failed to spawn {program} on pty: {err}"))?;
	drop(pair.slave);
	info!(target: "[SHELL]", "spawned {program} on pty (pid {:?})", child.process_id());

	let master = pair.master;
	let mut pty_reader = master
		.try_clone_reader()
		.map_err(|err| eyre::eyre!("pty reader: {err}"))?;
	let mut pty_writer = master.take_writer().map_err(|err| eyre::eyre!("pty writer: {err}"))?;
	let mut killer = child.clone_killer();

	// The pty is blocking I/O; bridge it with dedicated threads. The
	// threads end when the pty closes or their channel peer goes away.
	let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(16);
	std::thread::spawn(move || {
		let mut buf = [0u8; 8192];
		loop {
			match std::io::Read::read(&mut pty_reader, &mut buf) {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					if out_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
						break;
					}
				}
			}
		}
	});
	let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(16);
	std::thread::spawn(move || {
		while let Some(chunk) = in_rx.blocking_recv() {
			if std::io::Write::write_all(&mut pty_writer, &chunk).is_err() {
				break;
			}
			let _ = std::io::Write::flush(&mut pty_writer);
		}
	});
	let (exit_tx, mut exit_rx) = oneshot::channel();
	std::thread::spawn(move || {
		let _ = exit_tx.send(child.wait());
	});

	let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
	let stream_to_pty = async {
		let mut buf = [0u8; BUFFER_SIZE];
		loop {
			let n = stream_rd.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			if in_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
				break;
			}
		}
		Ok::<(), std::io::Error>(())
	};
	let pty_to_stream = async {
		while let Some(chunk) = out_rx.recv().await {
			stream_wr.write_all(&chunk).await?;
			stream_wr.flush().await?;
		}
		let _ = stream_wr.shutdown().await;
		Ok::<(), std::io::Error>(())
	};
	let io_task = async { tokio::try_join!(stream_to_pty, pty_to_stream).map(|_| ()) };
	tokio::pin!(io_task);

	let mut resize_frames = FramedRead::new(resize, JobCodec);
	let mut resize_open = true;
	let mut io_done = false;
	let mut exited = false;
	while !(io_done && exited) {
		tokio::select! {
			_ = cancel.cancelled() => {
				let _ = killer.kill();
				break;
			}
			res = &mut io_task, if !io_done => {
				io_done = true;
				if let Err(err) = res {
					debug!(target: "[SHELL]", "stream failed, killing {program}: {err}");
					let _ = killer.kill();
				}
			}
			status = &mut exit_rx, if !exited => {
				exited = true;
				match status {
					Ok(Ok(status)) => info!(target: "[SHELL]", "{program} exited with {status}"),
					_ => debug!(target: "[SHELL]", "{program} wait failed"),
				}
			}
			frame = resize_frames.next(), if resize_open => match frame {
				Some(Ok(Job::PtyResize { cols, rows })) => {
					debug!(target: "[SHELL]", "resize to {cols}x{rows}");
					let _ = master.resize(PtySize {
						rows,
						cols,
						pixel_width: 0,
						pixel_height: 0,
					});
				}
				Some(Ok(other)) => {
					warn!(target: "[SHELL]", "ignoring {:?} on the resize stream", other.tag());
				}
				Some(Err(err)) => {
					debug!(target: "[SHELL]", "resize stream broke: {err}");
					resize_open = false;
				}
				None => resize_open = false,
			},
		}
	}
	// Dropping the pty master tears the terminal down and unblocks the
	// bridge threads.
	drop(master);
	Ok(())
}
