//! Datagram relays: UDP payloads framed over mux streams.
//!
//! A UDP "connection" is a source address plus an idle window. The
//! listener side keeps one lane per source, each lane owning the paired
//! stream; the dialing side owns a connected socket. Either end of a
//! lane going quiet for the idle window retires it.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use goncat_mux::MuxStream;
use goncat_proto::DatagramCodec;
use tokio::{
	net::UdpSocket,
	sync::mpsc,
	time::{Duration, Instant, sleep_until},
};
use tokio_util::{codec::{FramedRead, FramedWrite}, sync::CancellationToken};
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65535;

/// Bridge a connected socket with a datagram-framed stream until either
/// side fails, the stream ends, or the lane idles out.
pub(crate) async fn relay_connected(
	stream: MuxStream,
	socket: UdpSocket,
	idle: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()> {
	let (read, write) = tokio::io::split(stream);
	let mut frames_in = FramedRead::new(read, DatagramCodec);
	let mut frames_out = FramedWrite::new(write, DatagramCodec);
	let mut buf = vec![0u8; MAX_DATAGRAM];
	let deadline = sleep_until(Instant::now() + idle);
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = &mut deadline => {
				debug!(target: "[UDP]", "lane idle, closing");
				break;
			}
			frame = frames_in.next() => match frame {
				Some(Ok(datagram)) => {
					socket.send(&datagram).await?;
					deadline.as_mut().reset(Instant::now() + idle);
				}
				Some(Err(err)) => return Err(err.into()),
				None => break,
			},
			received = socket.recv(&mut buf) => {
				let n = received?;
				frames_out.send(Bytes::copy_from_slice(&buf[..n])).await?;
				deadline.as_mut().reset(Instant::now() + idle);
			}
		}
	}
	Ok(())
}

/// Serve a bound UDP socket, one paired stream per datagram source.
///
/// `open` produces the stream for a new source (an `LpfDial` on the
/// master, an `RpfInbound` on the slave).
pub(crate) async fn serve_sessions<F, Fut>(
	socket: UdpSocket,
	open: F,
	idle: Duration,
	cancel: CancellationToken,
) -> eyre::Result<()>
where
	F: Fn() -> Fut,
	Fut: Future<Output = eyre::Result<MuxStream>>,
{
	let socket = Arc::new(socket);
	let mut lanes: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
	let (retired_tx, mut retired_rx) = mpsc::channel::<SocketAddr>(16);
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			Some(source) = retired_rx.recv() => {
				lanes.remove(&source);
			}
			received = socket.recv_from(&mut buf) => {
				let (n, source) = received?;
				let payload = Bytes::copy_from_slice(&buf[..n]);
				if let Some(lane) = lanes.get(&source) {
					if lane.try_send(payload).is_ok() {
						continue;
					}
					// Lane gone or saturated; a dead lane gets rebuilt below.
					if !lane.is_closed() {
						debug!(target: "[UDP]", "lane for {source} saturated, dropping datagram");
						continue;
					}
					lanes.remove(&source);
					continue;
				}
				let stream = match open().await {
					Ok(stream) => stream,
					Err(err) => {
						warn!(target: "[UDP]", "cannot open lane for {source}: {err:#}");
						continue;
					}
				};
				let (lane_tx, lane_rx) = mpsc::channel(64);
				let _ = lane_tx.try_send(payload);
				lanes.insert(source, lane_tx);
				tokio::spawn(run_lane(
					stream,
					lane_rx,
					socket.clone(),
					source,
					idle,
					cancel.child_token(),
					retired_tx.clone(),
				));
			}
		}
	}
	Ok(())
}

async fn run_lane(
	stream: MuxStream,
	mut from_socket: mpsc::Receiver<Bytes>,
	socket: Arc<UdpSocket>,
	source: SocketAddr,
	idle: Duration,
	cancel: CancellationToken,
	retired: mpsc::Sender<SocketAddr>,
) {
	let (read, write) = tokio::io::split(stream);
	let mut frames_in = FramedRead::new(read, DatagramCodec);
	let mut frames_out = FramedWrite::new(write, DatagramCodec);
	let deadline = sleep_until(Instant::now() + idle);
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = &mut deadline => break,
			datagram = from_socket.recv() => match datagram {
				Some(datagram) => {
					if let Err(err) = frames_out.send(datagram).await {
						debug!(target: "[UDP]", "lane for {source} failed: {err}");
						break;
					}
					deadline.as_mut().reset(Instant::now() + idle);
				}
				None => break,
			},
			frame = frames_in.next() => match frame {
				Some(Ok(datagram)) => {
					if let Err(err) = socket.send_to(&datagram, source).await {
						debug!(target: "[UDP]", "reply to {source} failed: {err}");
						break;
					}
					deadline.as_mut().reset(Instant::now() + idle);
				}
				Some(Err(err)) => {
					debug!(target: "[UDP]", "lane for {source} broke: {err}");
					break;
				}
				None => break,
			},
		}
	}
	let _ = retired.send(source).await;
}
