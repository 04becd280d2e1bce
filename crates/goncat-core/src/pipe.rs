use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bridge two byte streams until both directions have drained.
///
/// EOF on one direction half-closes the opposing write side and leaves the
/// other direction running; an error aborts both. Cancellation drops both
/// streams (closing them) and reports success. Returns the bytes moved
/// a→b and b→a.
pub async fn pipe<A, B>(a: A, b: B, cancel: &CancellationToken) -> io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Send,
	B: AsyncRead + AsyncWrite + Send,
{
	let (mut a_rd, mut a_wr) = tokio::io::split(a);
	let (mut b_rd, mut b_wr) = tokio::io::split(b);

	let a_to_b = async {
		let n = tokio::io::copy(&mut a_rd, &mut b_wr).await?;
		let _ = b_wr.shutdown().await;
		Ok::<u64, io::Error>(n)
	};
	let b_to_a = async {
		let n = tokio::io::copy(&mut b_rd, &mut a_wr).await?;
		let _ = a_wr.shutdown().await;
		Ok::<u64, io::Error>(n)
	};

	tokio::select! {
		_ = cancel.cancelled() => Ok((0, 0)),
		res = async { tokio::try_join!(a_to_b, b_to_a) } => res,
	}
}

/// Copy `r` into `w`, cloning every chunk into `tee` as it passes.
///
/// Used for the session transcript: the tee sees exactly the bytes that
/// reached `w`, in order. EOF shuts down `w` and flushes the tee.
pub async fn copy_tee<R, W, T>(mut r: R, mut w: W, mut tee: T) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	T: AsyncWrite + Unpin,
{
	let mut buf = [0u8; BUFFER_SIZE];
	let mut total = 0u64;
	loop {
		let n = r.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		w.write_all(&buf[..n]).await?;
		w.flush().await?;
		tee.write_all(&buf[..n]).await?;
		total += n as u64;
	}
	let _ = w.shutdown().await;
	let _ = tee.flush().await;
	Ok(total)
}
