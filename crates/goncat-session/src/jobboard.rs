//! The control-plane request discipline shared by both peers.
//!
//! The control stream is split exactly once: a framed reader owned by
//! the session loop, and a framed writer behind a mutex so any handler
//! may post. A job that carries a data path is posted and its stream
//! opened *under one writer lock*, which is what makes the positional
//! pairing sound: the n-th job a peer reads corresponds to the n-th
//! stream it accepts afterwards, no matter how many handlers race.

use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use goncat_mux::{MuxStream, Session};
use goncat_proto::{Job, JobCodec};
use snafu::ResultExt as _;
use tokio::{
	io::{ReadHalf, WriteHalf},
	sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

use crate::{ControlClosedSnafu, MuxSnafu, ProtocolSnafu, SessionError};

pub struct ControlReader {
	inner: FramedRead<ReadHalf<MuxStream>, JobCodec>,
}

impl ControlReader {
	/// Next job from the peer. `Ok(None)` is the peer's departure, clean
	/// close and dead connection alike; a decode failure is session-fatal.
	pub async fn next(&mut self) -> Result<Option<Job>, SessionError> {
		match self.inner.next().await {
			Some(Ok(job)) => {
				trace!(target: "[CTRL]", "received {:?}", job.tag());
				Ok(Some(job))
			}
			Some(Err(goncat_proto::ProtoError::Io { source, .. })) => {
				trace!(target: "[CTRL]", "control stream dropped: {source}");
				Ok(None)
			}
			Some(Err(err)) => Err(err).context(ProtocolSnafu),
			None => Ok(None),
		}
	}
}

#[derive(Clone)]
pub struct ControlWriter {
	inner:   Arc<Mutex<FramedWrite<WriteHalf<MuxStream>, JobCodec>>>,
	session: Session,
}

impl ControlWriter {
	/// Post a job that carries no data path.
	pub async fn post(&self, job: Job) -> Result<(), SessionError> {
		let mut writer = self.inner.lock().await;
		trace!(target: "[CTRL]", "posting {:?}", job.tag());
		writer.send(job).await.map_err(|_| ControlClosedSnafu.build())
	}

	/// Post a job and open its paired data stream atomically.
	pub async fn post_with_stream(&self, job: Job) -> Result<MuxStream, SessionError> {
		let mut writer = self.inner.lock().await;
		trace!(target: "[CTRL]", "posting {:?} with stream", job.tag());
		writer.send(job).await.map_err(|_| ControlClosedSnafu.build())?;
		self.session.open_stream().await.context(MuxSnafu)
	}

	/// Post a PTY shell job with its data stream and, right behind it,
	/// the resize stream (the two pair in that order on the peer).
	pub async fn post_pty_shell(&self, program: Option<String>) -> Result<(MuxStream, MuxStream), SessionError> {
		let mut writer = self.inner.lock().await;
		writer
			.send(Job::Shell { pty: true, program })
			.await
			.map_err(|_| ControlClosedSnafu.build())?;
		let data = self.session.open_stream().await.context(MuxSnafu)?;
		let resize = self.session.open_stream().await.context(MuxSnafu)?;
		Ok((data, resize))
	}
}

/// Split the control stream into its single reader and shared writer.
pub fn split_control(session: &Session, ctrl: MuxStream) -> (ControlReader, ControlWriter) {
	let (read, write) = tokio::io::split(ctrl);
	(
		ControlReader {
			inner: FramedRead::new(read, JobCodec),
		},
		ControlWriter {
			inner:   Arc::new(Mutex::new(FramedWrite::new(write, JobCodec))),
			session: session.clone(),
		},
	)
}
