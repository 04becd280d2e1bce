//! Server-side SOCKS5 negotiation (RFC 1928), spoken by the master with
//! the local proxy client. Only the negotiation lives here; the selected
//! target travels to the slave as a [`TargetCodec`](crate::TargetCodec)
//! record and the dial verdict comes back as one [`Reply`] byte.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use goncat_core::types::TargetAddr;
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::{Backtrace, ResultExt as _, Snafu, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ATYP_DOMAIN, ATYP_V4, ATYP_V6, ProtoError};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SocksError {
	#[snafu(display("peer speaks SOCKS{version}, not SOCKS5"))]
	Version {
		version:   u8,
		backtrace: Backtrace,
	},
	#[snafu(display("client offers no acceptable authentication method"))]
	NoAcceptableMethod {
		backtrace: Backtrace,
	},
	#[snafu(display("unknown address type {value}"))]
	AddressType {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("domain name is not valid UTF-8"))]
	Domain {
		source:    std::string::FromUtf8Error,
		backtrace: Backtrace,
	},
	#[snafu(display("domain `{domain}` does not fit one length octet"))]
	DomainTooLong {
		domain:    String,
		backtrace: Backtrace,
	},
	#[snafu(display("datagram too short for a SOCKS UDP header"))]
	ShortDatagram {
		backtrace: Backtrace,
	},
	#[snafu(display("fragmented SOCKS UDP datagrams are not supported"))]
	Fragmented {
		backtrace: Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Command {
	Connect      = 0x01,
	Bind         = 0x02,
	UdpAssociate = 0x03,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Reply {
	Succeeded               = 0x00,
	GeneralFailure          = 0x01,
	NotAllowed              = 0x02,
	NetworkUnreachable      = 0x03,
	HostUnreachable         = 0x04,
	ConnectionRefused       = 0x05,
	TtlExpired              = 0x06,
	CommandNotSupported     = 0x07,
	AddressTypeNotSupported = 0x08,
	#[num_enum(catch_all)]
	Other(u8),
}

impl Reply {
	/// Verdict byte for a dial attempt made on the client's behalf.
	pub fn for_dial_error(err: &std::io::Error) -> Self {
		use std::io::ErrorKind;
		match err.kind() {
			ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
			ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
			ErrorKind::HostUnreachable | ErrorKind::TimedOut => Reply::HostUnreachable,
			_ => Reply::GeneralFailure,
		}
	}
}

/// Run method selection, accepting only NO AUTHENTICATION REQUIRED.
pub async fn accept_no_auth<S>(stream: &mut S) -> Result<(), SocksError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut head = [0u8; 2];
	stream.read_exact(&mut head).await.context(IoSnafu)?;
	ensure!(head[0] == VERSION, VersionSnafu { version: head[0] });
	let mut methods = vec![0u8; head[1] as usize];
	stream.read_exact(&mut methods).await.context(IoSnafu)?;
	if !methods.contains(&METHOD_NO_AUTH) {
		stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await.context(IoSnafu)?;
		return NoAcceptableMethodSnafu.fail();
	}
	stream.write_all(&[VERSION, METHOD_NO_AUTH]).await.context(IoSnafu)?;
	Ok(())
}

/// Read the client's request: command plus target address.
pub async fn read_request<S>(stream: &mut S) -> Result<(Command, TargetAddr), SocksError>
where
	S: AsyncRead + Unpin,
{
	let mut head = [0u8; 4];
	stream.read_exact(&mut head).await.context(IoSnafu)?;
	ensure!(head[0] == VERSION, VersionSnafu { version: head[0] });
	let target = read_addr(stream, head[3]).await?;
	Ok((Command::from(head[1]), target))
}

async fn read_addr<S>(stream: &mut S, atyp: u8) -> Result<TargetAddr, SocksError>
where
	S: AsyncRead + Unpin,
{
	match atyp {
		ATYP_V4 => {
			let mut buf = [0u8; 6];
			stream.read_exact(&mut buf).await.context(IoSnafu)?;
			let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
			Ok(TargetAddr::V4(ip, u16::from_be_bytes([buf[4], buf[5]])))
		}
		ATYP_V6 => {
			let mut octets = [0u8; 16];
			stream.read_exact(&mut octets).await.context(IoSnafu)?;
			let mut port = [0u8; 2];
			stream.read_exact(&mut port).await.context(IoSnafu)?;
			Ok(TargetAddr::V6(Ipv6Addr::from(octets), u16::from_be_bytes(port)))
		}
		ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len).await.context(IoSnafu)?;
			let mut domain = vec![0u8; len[0] as usize];
			stream.read_exact(&mut domain).await.context(IoSnafu)?;
			let mut port = [0u8; 2];
			stream.read_exact(&mut port).await.context(IoSnafu)?;
			let domain = String::from_utf8(domain).context(DomainSnafu)?;
			Ok(TargetAddr::Domain(domain, u16::from_be_bytes(port)))
		}
		value => AddressTypeSnafu { value }.fail(),
	}
}

/// Answer the client's request with `reply` and the given bound address.
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bind: SocketAddr) -> Result<(), SocksError>
where
	S: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(22);
	buf.put_u8(VERSION);
	buf.put_u8(reply.into());
	buf.put_u8(0x00);
	match bind {
		SocketAddr::V4(addr) => {
			buf.put_u8(ATYP_V4);
			buf.put_slice(&addr.ip().octets());
			buf.put_u16(addr.port());
		}
		SocketAddr::V6(addr) => {
			buf.put_u8(ATYP_V6);
			buf.put_slice(&addr.ip().octets());
			buf.put_u16(addr.port());
		}
	}
	stream.write_all(&buf).await.context(IoSnafu)?;
	stream.flush().await.context(IoSnafu)?;
	Ok(())
}

/// One SOCKS5 UDP relay datagram, header already stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct UdpDatagram {
	pub target:  TargetAddr,
	pub payload: Bytes,
}

/// Strip the RSV/FRAG/address header from a relay datagram.
pub fn parse_udp_datagram(raw: &[u8]) -> Result<UdpDatagram, SocksError> {
	ensure!(raw.len() >= 4, ShortDatagramSnafu);
	ensure!(raw[2] == 0, FragmentedSnafu);
	let mut buf = BytesMut::from(&raw[3..]);
	let target = match crate::try_get_target(&mut buf) {
		Ok(Some(target)) => target,
		Ok(None) => return ShortDatagramSnafu.fail(),
		Err(ProtoError::UnknownAddressType { value, .. }) => return AddressTypeSnafu { value }.fail(),
		Err(_) => return ShortDatagramSnafu.fail(),
	};
	Ok(UdpDatagram {
		target,
		payload: buf.freeze(),
	})
}

/// Prepend the relay header to a payload heading back to the client.
pub fn encode_udp_datagram(target: &TargetAddr, payload: &[u8]) -> Result<Bytes, SocksError> {
	let mut buf = BytesMut::with_capacity(3 + 19 + payload.len());
	buf.put_slice(&[0x00, 0x00, 0x00]);
	crate::put_target(&mut buf, target).map_err(|_| {
		DomainTooLongSnafu {
			domain: target.authority(),
		}
		.build()
	})?;
	buf.put_slice(payload);
	Ok(buf.freeze())
}

#[cfg(test)]
mod test {
	use std::net::{Ipv4Addr, SocketAddr};

	use goncat_core::types::TargetAddr;
	use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, duplex};

	use super::{Command, Reply, SocksError, accept_no_auth, parse_udp_datagram, read_request, write_reply};

	#[tokio::test]
	async fn no_auth_handshake() -> eyre::Result<()> {
		let (mut client, mut server) = duplex(64);
		client.write_all(&[0x05, 0x01, 0x00]).await?;

		accept_no_auth(&mut server).await?;

		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await?;
		assert_eq!(reply, [0x05, 0x00]);
		Ok(())
	}

	#[tokio::test]
	async fn auth_only_client_is_refused() -> eyre::Result<()> {
		let (mut client, mut server) = duplex(64);
		// Offers only username/password.
		client.write_all(&[0x05, 0x01, 0x02]).await?;

		let res = accept_no_auth(&mut server).await;
		assert!(matches!(res, Err(SocksError::NoAcceptableMethod { .. })));

		let mut reply = [0u8; 2];
		client.read_exact(&mut reply).await?;
		assert_eq!(reply, [0x05, 0xff]);
		Ok(())
	}

	#[tokio::test]
	async fn connect_request_round_trip() -> eyre::Result<()> {
		let (mut client, mut server) = duplex(64);
		client
			.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
			.await?;

		let (cmd, target) = read_request(&mut server).await?;
		assert_eq!(cmd, Command::Connect);
		assert_eq!(target, TargetAddr::V4(Ipv4Addr::LOCALHOST, 8080));

		let bind: SocketAddr = "127.0.0.1:1080".parse()?;
		write_reply(&mut server, Reply::Succeeded, bind).await?;
		let mut reply = [0u8; 10];
		client.read_exact(&mut reply).await?;
		assert_eq!(&reply, &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);
		Ok(())
	}

	#[tokio::test]
	async fn domain_request() -> eyre::Result<()> {
		let (mut client, mut server) = duplex(64);
		let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x04];
		req.extend_from_slice(b"host");
		req.extend_from_slice(&9000u16.to_be_bytes());
		client.write_all(&req).await?;

		let (cmd, target) = read_request(&mut server).await?;
		assert_eq!(cmd, Command::Connect);
		assert_eq!(target, TargetAddr::Domain(String::from("host"), 9000));
		Ok(())
	}

	#[test]
	fn udp_header_round_trip() -> eyre::Result<()> {
		let target = TargetAddr::V4(Ipv4Addr::new(10, 0, 0, 1), 53);
		let encoded = super::encode_udp_datagram(&target, b"query")?;
		let parsed = parse_udp_datagram(&encoded)?;
		assert_eq!(parsed.target, target);
		assert_eq!(&parsed.payload[..], b"query");
		Ok(())
	}

	#[test]
	fn fragmented_datagrams_are_refused() {
		let raw = [0x00, 0x00, 0x01, 0x01, 127, 0, 0, 1, 0, 53, 0xaa];
		assert!(matches!(parse_udp_datagram(&raw), Err(SocksError::Fragmented { .. })));
	}
}
