use bytes::{Buf, BufMut, BytesMut};
use goncat_core::types::FwdProto;
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::{ResultExt as _, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	BytesRemainingSnafu, InvalidStringSnafu, ProtoError, RecordTooLargeSnafu, TrailingBytesSnafu, TruncatedSnafu,
	UnknownFwdProtoSnafu, UnknownJobTagSnafu,
};

/// Upper bound on one control record; anything larger is malformed.
pub const MAX_RECORD: usize = 64 * 1024;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum JobTag {
	Shell       = 1,
	PtyResize   = 2,
	LpfDial     = 3,
	RpfRegister = 4,
	RpfInbound  = 5,
	SocksOpen   = 6,
	#[num_enum(catch_all)]
	Other(u8),
}

/// One unit of work posted on the control stream.
///
/// Master→slave except `RpfInbound`, which the slave posts when a
/// registered remote-forward listener accepts a connection. `PtyResize`
/// travels on the dedicated resize stream of a PTY shell, not on the
/// control stream itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
	Shell {
		pty:     bool,
		program: Option<String>,
	},
	PtyResize {
		cols: u16,
		rows: u16,
	},
	LpfDial {
		proto: FwdProto,
		host:  String,
		port:  u16,
	},
	RpfRegister {
		proto:       FwdProto,
		bind_host:   String,
		bind_port:   u16,
		target_host: String,
		target_port: u16,
	},
	RpfInbound {
		host: String,
		port: u16,
	},
	SocksOpen,
}

impl Job {
	pub fn tag(&self) -> JobTag {
		match self {
			Job::Shell { .. } => JobTag::Shell,
			Job::PtyResize { .. } => JobTag::PtyResize,
			Job::LpfDial { .. } => JobTag::LpfDial,
			Job::RpfRegister { .. } => JobTag::RpfRegister,
			Job::RpfInbound { .. } => JobTag::RpfInbound,
			Job::SocksOpen => JobTag::SocksOpen,
		}
	}
}

/// Length-prefixed job records: u32 big-endian payload length, tag byte,
/// then the tag's fields in fixed order. Strings are u16-length-prefixed
/// UTF-8.
#[derive(Debug, Clone, Copy)]
pub struct JobCodec;

fn get_u8_field(buf: &mut BytesMut) -> Result<u8, ProtoError> {
	ensure!(buf.remaining() >= 1, TruncatedSnafu);
	Ok(buf.get_u8())
}

fn get_u16_field(buf: &mut BytesMut) -> Result<u16, ProtoError> {
	ensure!(buf.remaining() >= 2, TruncatedSnafu);
	Ok(buf.get_u16())
}

fn get_string(buf: &mut BytesMut) -> Result<String, ProtoError> {
	let len = get_u16_field(buf)? as usize;
	ensure!(buf.remaining() >= len, TruncatedSnafu);
	String::from_utf8(buf.split_to(len).to_vec()).context(InvalidStringSnafu)
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtoError> {
	ensure!(s.len() <= u16::MAX as usize, RecordTooLargeSnafu { len: s.len(), max: u16::MAX as usize });
	dst.put_u16(s.len() as u16);
	dst.put_slice(s.as_bytes());
	Ok(())
}

fn get_fwd_proto(buf: &mut BytesMut) -> Result<FwdProto, ProtoError> {
	match get_u8_field(buf)? {
		1 => Ok(FwdProto::Tcp),
		2 => Ok(FwdProto::Udp),
		value => UnknownFwdProtoSnafu { value }.fail(),
	}
}

fn put_fwd_proto(dst: &mut BytesMut, proto: FwdProto) {
	dst.put_u8(match proto {
		FwdProto::Tcp => 1,
		FwdProto::Udp => 2,
	});
}

impl Decoder for JobCodec {
	type Error = ProtoError;
	type Item = Job;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 4 {
			return Ok(None);
		}
		let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
		ensure!(len <= MAX_RECORD, RecordTooLargeSnafu { len, max: MAX_RECORD });
		ensure!(len >= 1, TruncatedSnafu);
		if src.len() < 4 + len {
			src.reserve(4 + len - src.len());
			return Ok(None);
		}
		src.advance(4);
		let mut payload = src.split_to(len);

		let tag = JobTag::from(payload.get_u8());
		let job = match tag {
			JobTag::Shell => {
				let pty = get_u8_field(&mut payload)? != 0;
				let program = match get_u8_field(&mut payload)? {
					0 => None,
					_ => Some(get_string(&mut payload)?),
				};
				Job::Shell { pty, program }
			}
			JobTag::PtyResize => Job::PtyResize {
				cols: get_u16_field(&mut payload)?,
				rows: get_u16_field(&mut payload)?,
			},
			JobTag::LpfDial => Job::LpfDial {
				proto: get_fwd_proto(&mut payload)?,
				host:  get_string(&mut payload)?,
				port:  get_u16_field(&mut payload)?,
			},
			JobTag::RpfRegister => Job::RpfRegister {
				proto:       get_fwd_proto(&mut payload)?,
				bind_host:   get_string(&mut payload)?,
				bind_port:   get_u16_field(&mut payload)?,
				target_host: get_string(&mut payload)?,
				target_port: get_u16_field(&mut payload)?,
			},
			JobTag::RpfInbound => Job::RpfInbound {
				host: get_string(&mut payload)?,
				port: get_u16_field(&mut payload)?,
			},
			JobTag::SocksOpen => Job::SocksOpen,
			JobTag::Other(value) => return UnknownJobTagSnafu { value }.fail(),
		};
		ensure!(payload.is_empty(), TrailingBytesSnafu { extra: payload.len() });
		Ok(Some(job))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<Job> for JobCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Job, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let mut payload = BytesMut::with_capacity(32);
		payload.put_u8(item.tag().into());
		match &item {
			Job::Shell { pty, program } => {
				payload.put_u8(*pty as u8);
				match program {
					Some(program) => {
						payload.put_u8(1);
						put_string(&mut payload, program)?;
					}
					None => payload.put_u8(0),
				}
			}
			Job::PtyResize { cols, rows } => {
				payload.put_u16(*cols);
				payload.put_u16(*rows);
			}
			Job::LpfDial { proto, host, port } => {
				put_fwd_proto(&mut payload, *proto);
				put_string(&mut payload, host)?;
				payload.put_u16(*port);
			}
			Job::RpfRegister {
				proto,
				bind_host,
				bind_port,
				target_host,
				target_port,
			} => {
				put_fwd_proto(&mut payload, *proto);
				put_string(&mut payload, bind_host)?;
				payload.put_u16(*bind_port);
				put_string(&mut payload, target_host)?;
				payload.put_u16(*target_port);
			}
			Job::RpfInbound { host, port } => {
				put_string(&mut payload, host)?;
				payload.put_u16(*port);
			}
			Job::SocksOpen => {}
		}
		ensure!(payload.len() <= MAX_RECORD, RecordTooLargeSnafu { len: payload.len(), max: MAX_RECORD });
		dst.reserve(4 + payload.len());
		dst.put_u32(payload.len() as u32);
		dst.extend_from_slice(&payload);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use futures_util::SinkExt as _;
	use goncat_core::types::FwdProto;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::{Job, JobCodec};
	use crate::ProtoError;

	fn sample_jobs() -> Vec<Job> {
		vec![
			Job::Shell {
				pty:     false,
				program: Some(String::from("/bin/sh")),
			},
			Job::Shell { pty: true, program: None },
			Job::PtyResize { cols: 80, rows: 24 },
			Job::LpfDial {
				proto: FwdProto::Tcp,
				host:  String::from("127.0.0.1"),
				port:  9000,
			},
			Job::RpfRegister {
				proto:       FwdProto::Udp,
				bind_host:   String::new(),
				bind_port:   8080,
				target_host: String::from("localhost"),
				target_port: 9090,
			},
			Job::RpfInbound {
				host: String::from("localhost"),
				port: 9090,
			},
			Job::SocksOpen,
		]
	}

	/// Usual round trip
	#[tokio::test]
	async fn test_job_1() -> eyre::Result<()> {
		let buffer = Vec::with_capacity(256);
		let mut writer = FramedWrite::new(buffer, JobCodec);
		for job in sample_jobs() {
			writer.send(job).await?;
		}
		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), JobCodec);
		for job in sample_jobs() {
			let frame = reader.next().await.unwrap()?;
			assert_eq!(job, frame);
		}
		assert!(reader.next().await.is_none());
		Ok(())
	}

	/// Data not fully arrived
	#[tokio::test]
	async fn test_job_2() -> eyre::Result<()> {
		for job in sample_jobs() {
			let buffer = Vec::with_capacity(256);
			let mut writer = FramedWrite::new(buffer, JobCodec);
			writer.send(job.clone()).await?;
			let mut buffer = writer.into_inner();
			let full_len = buffer.len();
			let mut half_b = buffer.split_off(full_len / 2);
			let mut half_a = buffer;
			{
				let mut reader = FramedRead::new(half_a.as_slice(), JobCodec);
				assert!(matches!(
					reader.next().await.unwrap().unwrap_err(),
					ProtoError::BytesRemaining
				));
			}
			half_a.append(&mut half_b);
			let mut reader = FramedRead::new(half_a.as_slice(), JobCodec);
			assert_eq!(reader.next().await.unwrap()?, job);
		}
		Ok(())
	}

	/// An unrecognised tag must surface as an error, not be skipped.
	#[tokio::test]
	async fn test_job_unknown_tag() {
		let frame: &[u8] = &[0, 0, 0, 1, 99];
		let mut reader = FramedRead::new(frame, JobCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::UnknownJobTag { value: 99, .. }
		));
	}

	#[tokio::test]
	async fn test_job_oversized_length() {
		let frame: &[u8] = &[0xff, 0xff, 0xff, 0xff, 1];
		let mut reader = FramedRead::new(frame, JobCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::RecordTooLarge { .. }
		));
	}

	#[tokio::test]
	async fn test_job_trailing_bytes() {
		// A SocksOpen record padded with one stray byte.
		let frame: &[u8] = &[0, 0, 0, 2, 6, 0xaa];
		let mut reader = FramedRead::new(frame, JobCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::TrailingBytes { extra: 1, .. }
		));
	}
}
