//! End-to-end session tests: master and slave loops wired over
//! in-process pipes (and real QUIC for the transport round-trip), with
//! the operator's stdio injected.

use std::{sync::Arc, time::Duration};

use goncat_core::{PeerConn, sem::TimedSemaphore, types::Addr};
use goncat_mux::Session;
use goncat_proto::Job;
use goncat_session::{
	MasterConfig, SlaveConfig,
	master::{OperatorIo, run_master},
	slave::run_slave,
	split_control,
};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
	net::{TcpListener, TcpStream},
	task::JoinHandle,
	time::timeout,
};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn base_cfg() -> MasterConfig {
	MasterConfig {
		exec:            None,
		pty:             false,
		log_file:        None,
		local_forwards:  Vec::new(),
		remote_forwards: Vec::new(),
		socks:           None,
		timeout:         TIMEOUT,
	}
}

/// Operator stdio backed by pipes: returns (io, feed-input, drain-output).
fn operator_pipes() -> (OperatorIo, DuplexStream, DuplexStream) {
	let (input_feed, input) = duplex(64 * 1024);
	let (output, output_drain) = duplex(64 * 1024);
	let io = OperatorIo {
		input:        Box::new(input),
		output:       Box::new(output),
		raw_terminal: false,
	};
	(io, input_feed, output_drain)
}

type SessionHandle = JoinHandle<eyre::Result<()>>;

fn spawn_pair(cfg: MasterConfig, io: OperatorIo) -> (SessionHandle, SessionHandle, CancellationToken) {
	let (master_conn, slave_conn) = duplex(256 * 1024);
	let root = CancellationToken::new();
	let sem = TimedSemaphore::new(1, TIMEOUT);
	let master = tokio::spawn(run_master(
		Box::new(master_conn) as PeerConn,
		Arc::new(cfg),
		io,
		sem,
		root.clone(),
	));
	let slave = tokio::spawn(run_slave(
		Box::new(slave_conn) as PeerConn,
		SlaveConfig { timeout: TIMEOUT },
		root.clone(),
	));
	(master, slave, root)
}

async fn read_until(rd: &mut (impl AsyncRead + Unpin), needle: &[u8]) -> eyre::Result<Vec<u8>> {
	let collected = timeout(TIMEOUT, async {
		let mut all = Vec::new();
		let mut buf = [0u8; 1024];
		loop {
			let n = rd.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			all.extend_from_slice(&buf[..n]);
			if all.windows(needle.len()).any(|w| w == needle) {
				break;
			}
		}
		Ok::<Vec<u8>, std::io::Error>(all)
	})
	.await??;
	eyre::ensure!(
		collected.windows(needle.len()).any(|w| w == needle),
		"stream closed without {:?} in {:?}",
		String::from_utf8_lossy(needle),
		String::from_utf8_lossy(&collected),
	);
	Ok(collected)
}

/// A mock target replying to every chunk with a prefixed copy.
async fn prefix_server(prefix: &'static str) -> eyre::Result<u16> {
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let port = listener.local_addr()?.port();
	tokio::spawn(async move {
		while let Ok((mut conn, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 1024];
				loop {
					match conn.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							let mut reply = prefix.as_bytes().to_vec();
							reply.extend_from_slice(&buf[..n]);
							if conn.write_all(&reply).await.is_err() {
								break;
							}
						}
					}
				}
			});
		}
	});
	Ok(port)
}

fn free_port(udp: bool) -> u16 {
	if udp {
		std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
	} else {
		std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
	}
}

/// S1: plain shell echo over the session.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn shell_echo() -> eyre::Result<()> {
	let mut cfg = base_cfg();
	cfg.exec = Some("/bin/sh".to_string());
	let (io, mut feed, mut drain) = operator_pipes();
	let (master, slave, _root) = spawn_pair(cfg, io);

	feed.write_all(b"echo hello\nexit\n").await?;
	feed.flush().await?;
	read_until(&mut drain, b"hello").await?;

	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// The shell's remote output lands in the transcript file as well.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn shell_transcript() -> eyre::Result<()> {
	let log_path = std::env::temp_dir().join(format!("goncat-transcript-{}.log", std::process::id()));
	let _ = std::fs::remove_file(&log_path);

	let mut cfg = base_cfg();
	cfg.exec = Some("/bin/sh".to_string());
	cfg.log_file = Some(log_path.clone());
	let (io, mut feed, mut drain) = operator_pipes();
	let (master, slave, _root) = spawn_pair(cfg, io);

	feed.write_all(b"echo transcribed\nexit\n").await?;
	read_until(&mut drain, b"transcribed").await?;
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;

	let transcript = std::fs::read_to_string(&log_path)?;
	assert!(transcript.contains("transcribed"));
	let _ = std::fs::remove_file(&log_path);
	Ok(())
}

/// S3: local forward to a mock server on the slave's side.
#[test_log::test(tokio::test)]
async fn local_forward() -> eyre::Result<()> {
	let target_port = prefix_server("REMOTE:").await?;
	let bind_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.local_forwards = vec![format!("127.0.0.1:{bind_port}:127.0.0.1:{target_port}").parse()?];
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	let mut client = TcpStream::connect(("127.0.0.1", bind_port)).await?;
	client.write_all(b"Hi").await?;
	let mut reply = [0u8; 9];
	timeout(TIMEOUT, client.read_exact(&mut reply)).await??;
	assert_eq!(&reply, b"REMOTE:Hi");

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// S4: an allowed target that is dead closes the inbound stream with a
/// contained error; the slave's listener stays up for the next client.
#[test_log::test(tokio::test)]
async fn remote_forward_dead_target_keeps_listener() -> eyre::Result<()> {
	let bind_port = free_port(false);
	let dead_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.remote_forwards = vec![format!("127.0.0.1:{bind_port}:127.0.0.1:{dead_port}").parse()?];
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	for _ in 0..2 {
		let mut inbound = TcpStream::connect(("127.0.0.1", bind_port)).await?;
		// Master dials the dead target, fails, and closes our stream.
		let mut one = [0u8; 1];
		let read = timeout(TIMEOUT, inbound.read(&mut one)).await?;
		assert!(matches!(read, Ok(0) | Err(_)), "expected the bridge to close");
	}

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// A working remote forward end to end.
#[test_log::test(tokio::test)]
async fn remote_forward_round_trip() -> eyre::Result<()> {
	let target_port = prefix_server("LOCAL:").await?;
	let bind_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.remote_forwards = vec![format!("127.0.0.1:{bind_port}:127.0.0.1:{target_port}").parse()?];
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	let mut inbound = TcpStream::connect(("127.0.0.1", bind_port)).await?;
	inbound.write_all(b"ping").await?;
	let mut reply = [0u8; 10];
	timeout(TIMEOUT, inbound.read_exact(&mut reply)).await??;
	assert_eq!(&reply, b"LOCAL:ping");

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// Allow-list enforcement: an inbound notification for a tuple the
/// master never registered closes the stream without any local dial.
#[test_log::test(tokio::test)]
async fn allow_list_refuses_unlisted_target() -> eyre::Result<()> {
	let (master_conn, fake_slave_conn) = duplex(64 * 1024);
	let root = CancellationToken::new();
	let mut cfg = base_cfg();
	cfg.remote_forwards = vec!["9999:allowed.example:1111".parse()?];
	let (io, _feed, _drain) = operator_pipes();
	let master = tokio::spawn(run_master(
		Box::new(master_conn) as PeerConn,
		Arc::new(cfg),
		io,
		TimedSemaphore::new(1, TIMEOUT),
		root.clone(),
	));

	// A hand-driven slave: accept the registration, then notify for a
	// target the master never listed.
	let session = Session::server(Box::new(fake_slave_conn) as PeerConn, CancellationToken::new());
	let ctrl = session.accept_stream().await?;
	let (mut reader, writer) = split_control(&session, ctrl);
	let job = timeout(TIMEOUT, reader.next()).await??.expect("registration");
	assert!(matches!(job, Job::RpfRegister { bind_port: 9999, .. }));

	let victim = TcpListener::bind("127.0.0.1:0").await?;
	let victim_port = victim.local_addr()?.port();
	let mut stream = writer
		.post_with_stream(Job::RpfInbound {
			host: "127.0.0.1".to_string(),
			port: victim_port,
		})
		.await?;

	// The stream is closed by the master within a round trip...
	let mut one = [0u8; 1];
	let read = timeout(TIMEOUT, stream.read(&mut one)).await?;
	assert!(matches!(read, Ok(0) | Err(_)), "expected the refused stream to close");

	// ...and no dial ever reaches the unlisted target.
	assert!(timeout(Duration::from_millis(300), victim.accept()).await.is_err());

	root.cancel();
	timeout(TIMEOUT, master).await???;
	Ok(())
}

/// S5: SOCKS5 CONNECT spoken byte by byte against the master's proxy
/// listener, with the dial happening on the slave's side.
#[test_log::test(tokio::test)]
async fn socks5_connect() -> eyre::Result<()> {
	let target_port = prefix_server("SERVER:").await?;
	let socks_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.socks = Some(format!("127.0.0.1:{socks_port}").parse()?);
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	let mut client = TcpStream::connect(("127.0.0.1", socks_port)).await?;
	client.write_all(&[0x05, 0x01, 0x00]).await?;
	let mut method = [0u8; 2];
	timeout(TIMEOUT, client.read_exact(&mut method)).await??;
	assert_eq!(method, [0x05, 0x00]);

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&target_port.to_be_bytes());
	client.write_all(&request).await?;
	let mut reply = [0u8; 10];
	timeout(TIMEOUT, client.read_exact(&mut reply)).await??;
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x00, "expected success, got {:#04x}", reply[1]);

	client.write_all(b"Hello").await?;
	let mut payload = [0u8; 12];
	timeout(TIMEOUT, client.read_exact(&mut payload)).await??;
	assert_eq!(&payload, b"SERVER:Hello");

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// A CONNECT to a dead target maps onto a SOCKS failure reply.
#[test_log::test(tokio::test)]
async fn socks5_connect_refused() -> eyre::Result<()> {
	let dead_port = free_port(false);
	let socks_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.socks = Some(format!("127.0.0.1:{socks_port}").parse()?);
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	let mut client = TcpStream::connect(("127.0.0.1", socks_port)).await?;
	client.write_all(&[0x05, 0x01, 0x00]).await?;
	let mut method = [0u8; 2];
	timeout(TIMEOUT, client.read_exact(&mut method)).await??;

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&dead_port.to_be_bytes());
	client.write_all(&request).await?;
	let mut reply = [0u8; 10];
	timeout(TIMEOUT, client.read_exact(&mut reply)).await??;
	assert_eq!(reply[1], 0x05, "expected connection-refused, got {:#04x}", reply[1]);

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// Prop 9: an unrecognised tag on the control stream is fatal to the
/// session, and promptly so.
#[test_log::test(tokio::test)]
async fn unknown_tag_tears_the_session_down() -> eyre::Result<()> {
	let (master_conn, fake_conn) = duplex(64 * 1024);
	let root = CancellationToken::new();
	let (io, _feed, _drain) = operator_pipes();
	let master = tokio::spawn(run_master(
		Box::new(master_conn) as PeerConn,
		Arc::new(base_cfg()),
		io,
		TimedSemaphore::new(1, TIMEOUT),
		root.clone(),
	));

	let session = Session::server(Box::new(fake_conn) as PeerConn, CancellationToken::new());
	let mut ctrl = session.accept_stream().await?;
	// Length 1, tag 42: no such job.
	ctrl.write_all(&[0, 0, 0, 1, 42]).await?;
	ctrl.flush().await?;

	let res = timeout(TIMEOUT, master).await??;
	assert!(res.is_err(), "master must treat an unknown tag as fatal");
	Ok(())
}

/// Prop 8: cancelling the root context unwinds both loops promptly.
#[test_log::test(tokio::test)]
async fn cancellation_tears_down_within_timeout() -> eyre::Result<()> {
	let target_port = prefix_server("X:").await?;
	let bind_port = free_port(false);
	let mut cfg = base_cfg();
	cfg.local_forwards = vec![format!("127.0.0.1:{bind_port}:127.0.0.1:{target_port}").parse()?];
	let (io, _feed, _drain) = operator_pipes();
	let (master, slave, root) = spawn_pair(cfg, io);
	tokio::time::sleep(Duration::from_millis(300)).await;

	// An active bridge should not keep the session alive past cancel.
	let mut client = TcpStream::connect(("127.0.0.1", bind_port)).await?;
	client.write_all(b"busy").await?;

	root.cancel();
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}

/// S6 over the real thing: a QUIC listener on the slave side, a shell
/// session from the master side.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn quic_shell_session() -> eyre::Result<()> {
	use goncat_transport::{ConnHandler, dial, listen_and_serve};

	struct SlaveEnd {
		root: CancellationToken,
	}

	impl ConnHandler for SlaveEnd {
		async fn handle(&self, conn: PeerConn) -> eyre::Result<()> {
			run_slave(conn, SlaveConfig { timeout: TIMEOUT }, self.root.child_token()).await
		}
	}

	let addr: Addr = format!("udp://127.0.0.1:{}", free_port(true)).parse()?;
	let root = CancellationToken::new();
	let listener = {
		let addr = addr.clone();
		let root = root.clone();
		let handler = Arc::new(SlaveEnd { root: root.clone() });
		tokio::spawn(async move { listen_and_serve(&addr, TIMEOUT, handler, root).await })
	};
	tokio::time::sleep(Duration::from_millis(300)).await;

	let conn = dial(&addr, TIMEOUT).await?;
	let mut cfg = base_cfg();
	cfg.exec = Some("/bin/sh".to_string());
	let (io, mut feed, mut drain) = operator_pipes();
	let master = tokio::spawn(run_master(
		conn,
		Arc::new(cfg),
		io,
		TimedSemaphore::new(1, TIMEOUT),
		root.clone(),
	));

	feed.write_all(b"echo hello\nexit\n").await?;
	read_until(&mut drain, b"hello").await?;
	timeout(TIMEOUT, master).await???;

	root.cancel();
	timeout(TIMEOUT, listener).await???;
	Ok(())
}

/// With the operator's stdio already claimed, a second shell job is
/// refused cleanly and the session simply winds down.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn stdio_semaphore_refuses_second_shell() -> eyre::Result<()> {
	let (master_conn, slave_conn) = duplex(64 * 1024);
	let root = CancellationToken::new();
	let sem = TimedSemaphore::new(1, Duration::from_millis(200));
	let _held = sem.try_acquire().expect("fresh semaphore");

	let mut cfg = base_cfg();
	cfg.exec = Some("/bin/sh".to_string());
	let (io, _feed, _drain) = operator_pipes();
	let master = tokio::spawn(run_master(
		Box::new(master_conn) as PeerConn,
		Arc::new(cfg),
		io,
		sem,
		root.clone(),
	));
	let slave = tokio::spawn(run_slave(
		Box::new(slave_conn) as PeerConn,
		SlaveConfig { timeout: TIMEOUT },
		root.clone(),
	));

	// The refusal ends the interactive part, which ends the session.
	timeout(TIMEOUT, master).await???;
	timeout(TIMEOUT, slave).await???;
	Ok(())
}
