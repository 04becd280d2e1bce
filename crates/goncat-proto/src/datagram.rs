use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};

use crate::{BytesRemainingSnafu, OversizedDatagramSnafu, ProtoError};

/// u16-big-endian length framing for datagrams carried over a stream.
///
/// Used wherever UDP payloads cross the session: UDP port forwards and
/// the SOCKS5 UDP-associate relay. Preserves datagram boundaries; an
/// empty datagram is legal.
#[derive(Debug, Clone, Copy)]
pub struct DatagramCodec;

impl Decoder for DatagramCodec {
	type Error = ProtoError;
	type Item = Bytes;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < 2 {
			return Ok(None);
		}
		let len = u16::from_be_bytes([src[0], src[1]]) as usize;
		if src.len() < 2 + len {
			src.reserve(2 + len - src.len());
			return Ok(None);
		}
		src.advance(2);
		Ok(Some(src.split_to(len).freeze()))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => BytesRemainingSnafu.fail(),
			v => v,
		}
	}
}

impl Encoder<Bytes> for DatagramCodec {
	type Error = ProtoError;

	fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
		ensure!(item.len() <= u16::MAX as usize, OversizedDatagramSnafu { len: item.len() });
		dst.reserve(2 + item.len());
		dst.put_u16(item.len() as u16);
		dst.extend_from_slice(&item);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use bytes::Bytes;
	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::DatagramCodec;

	#[tokio::test]
	async fn boundaries_survive_framing() -> eyre::Result<()> {
		let packets = vec![
			Bytes::from_static(b"first"),
			Bytes::new(),
			Bytes::from(vec![0u8; 1500]),
		];
		let mut writer = FramedWrite::new(Vec::new(), DatagramCodec);
		for p in &packets {
			writer.send(p.clone()).await?;
		}
		let buffer = writer.into_inner();
		let mut reader = FramedRead::new(buffer.as_slice(), DatagramCodec);
		for p in packets {
			assert_eq!(reader.next().await.unwrap()?, p);
		}
		assert!(reader.next().await.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn oversized_payload_is_refused() {
		let mut writer = FramedWrite::new(Vec::new(), DatagramCodec);
		let huge = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
		assert!(writer.send(huge).await.is_err());
	}
}
