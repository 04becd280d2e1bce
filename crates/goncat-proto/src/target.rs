use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};
use goncat_core::types::TargetAddr;
use snafu::{ResultExt as _, ensure};
use tokio_util::codec::{Decoder, Encoder};

use crate::{BytesRemainingSnafu, InvalidStringSnafu, ProtoError, RecordTooLargeSnafu, UnknownAddressTypeSnafu};

// RFC 1928 address type octets, reused for every on-stream target record.
pub const ATYP_V4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_V6: u8 = 0x04;

/// Codec for dial targets: type octet, address, u16 port. This is the
/// SOCKS5 address encoding, so the same bytes serve the proxy wire
/// format and the slave-bound target records.
#[derive(Debug, Clone, Copy)]
pub struct TargetCodec;

/// Append one target record to `dst`.
pub fn put_target(dst: &mut BytesMut, target: &TargetAddr) -> Result<(), ProtoError> {
	match target {
		TargetAddr::V4(ip, port) => {
			dst.reserve(1 + 4 + 2);
			dst.put_u8(ATYP_V4);
			dst.put_slice(&ip.octets());
			dst.put_u16(*port);
		}
		TargetAddr::V6(ip, port) => {
			dst.reserve(1 + 16 + 2);
			dst.put_u8(ATYP_V6);
			dst.put_slice(&ip.octets());
			dst.put_u16(*port);
		}
		TargetAddr::Domain(domain, port) => {
			ensure!(domain.len() <= u8::MAX as usize, RecordTooLargeSnafu {
				len: domain.len(),
				max: u8::MAX as usize
			});
			dst.reserve(1 + 1 + domain.len() + 2);
			dst.put_u8(ATYP_DOMAIN);
			dst.put_u8(domain.len() as u8);
			dst.put_slice(domain.as_bytes());
			dst.put_u16(*port);
		}
	}
	Ok(())
}

/// Incremental decode of one target record; `Ok(None)` wants more bytes.
pub fn try_get_target(src: &mut BytesMut) -> Result<Option<TargetAddr>, ProtoError> {
	if src.is_empty() {
		return Ok(None);
	}
	match src[0] {
		ATYP_V4 => {
			if src.len() < 1 + 4 + 2 {
				return Ok(None);
			}
			src.advance(1);
			let mut octets = [0u8; 4];
			src.copy_to_slice(&mut octets);
			Ok(Some(TargetAddr::V4(Ipv4Addr::from(octets), src.get_u16())))
		}
		ATYP_V6 => {
			if src.len() < 1 + 16 + 2 {
				return Ok(None);
			}
			src.advance(1);
			let mut octets = [0u8; 16];
			src.copy_to_slice(&mut octets);
			Ok(Some(TargetAddr::V6(Ipv6Addr::from(octets), src.get_u16())))
		}
		ATYP_DOMAIN => {
			if src.len() < 2 {
				return Ok(None);
			}
			let domain_len = src[1] as usize;
			if src.len() < 2 + domain_len + 2 {
				return Ok(None);
			}
			src.advance(2);
			let domain = String::from_utf8(src.split_to(domain_len).to_vec()).context(InvalidStringSnafu)?;
			Ok(Some(TargetAddr::Domain(domain, src.get_u16())))
		}
		value => UnknownAddressTypeSnafu { value }.fail(),
	}
}

impl Decoder for TargetCodec {
	type Error = ProtoError;
	type Item = TargetAddr;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		try_get_target(src)
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<TargetAddr> for TargetCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: TargetAddr, dst: &mut BytesMut) -> Result<(), Self::Error> {
		put_target(dst, &item)
	}
}

#[cfg(test)]
mod test {
	use std::net::{Ipv4Addr, Ipv6Addr};

	use futures_util::SinkExt as _;
	use goncat_core::types::TargetAddr;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::TargetCodec;
	use crate::ProtoError;

	#[test_log::test(tokio::test)]
	async fn test_target_1() -> eyre::Result<()> {
		let vars = vec![
			TargetAddr::V4(Ipv4Addr::LOCALHOST, 8080),
			TargetAddr::V6(Ipv6Addr::LOCALHOST, 443),
			TargetAddr::Domain(String::from("internal.example"), 9000),
		];
		let buffer = Vec::with_capacity(128);
		let mut writer = FramedWrite::new(buffer, TargetCodec);
		for var in &vars {
			writer.send(var.clone()).await?;
		}
		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), TargetCodec);
		for var in vars {
			assert_eq!(reader.next().await.unwrap()?, var);
		}
		Ok(())
	}

	/// Partial buffers yield until the record completes.
	#[test_log::test(tokio::test)]
	async fn test_target_2() -> eyre::Result<()> {
		let addr = TargetAddr::Domain(String::from("internal.example"), 9000);
		let buffer = Vec::with_capacity(128);
		let mut writer = FramedWrite::new(buffer, TargetCodec);
		writer.send(addr.clone()).await?;
		let mut buffer = writer.into_inner();
		let mut half_b = buffer.split_off(buffer.len() / 2);
		let mut half_a = buffer;
		{
			let mut reader = FramedRead::new(half_a.as_slice(), TargetCodec);
			assert!(matches!(
				reader.next().await.unwrap().unwrap_err(),
				ProtoError::BytesRemaining
			));
		}
		half_a.append(&mut half_b);
		let mut reader = FramedRead::new(half_a.as_slice(), TargetCodec);
		assert_eq!(reader.next().await.unwrap()?, addr);
		Ok(())
	}

	#[tokio::test]
	async fn test_target_unknown_type() {
		let frame: &[u8] = &[0x02, 0, 0, 0];
		let mut reader = FramedRead::new(frame, TargetCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			ProtoError::UnknownAddressType { value: 2, .. }
		));
	}
}
