use std::{
	fmt,
	net::{Ipv4Addr, Ipv6Addr},
	str::FromStr,
};

use snafu::{Snafu, ensure};

/// Transport carrying the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
	Tcp,
	Ws,
	Wss,
	Udp,
}

impl fmt::Display for Proto {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Proto::Tcp => "tcp",
			Proto::Ws => "ws",
			Proto::Wss => "wss",
			Proto::Udp => "udp",
		};
		f.write_str(s)
	}
}

/// Payload protocol of a port forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FwdProto {
	Tcp,
	Udp,
}

impl fmt::Display for FwdProto {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			FwdProto::Tcp => "tcp",
			FwdProto::Udp => "udp",
		})
	}
}

#[derive(Debug, Snafu)]
pub enum ParseError {
	#[snafu(display("address `{input}` is not of the form proto://host:port"))]
	AddrSyntax { input: String },
	#[snafu(display("unknown protocol `{proto}` (expected tcp, ws, wss or udp)"))]
	UnknownProto { proto: String },
	#[snafu(display("invalid port `{port}`"))]
	Port { port: String },
	#[snafu(display("port must not be 0"))]
	PortZero,
	#[snafu(display("forward spec `{input}` must have 3 or 4 colon-separated fields"))]
	ForwardSyntax { input: String },
	#[snafu(display("forward spec `{input}` has an empty target host"))]
	EmptyTarget { input: String },
	#[snafu(display("socks spec `{input}` is not of the form [host:]port"))]
	SocksSyntax { input: String },
}

fn parse_port(s: &str) -> Result<u16, ParseError> {
	let port: u16 = s.parse().map_err(|_| ParseError::Port { port: s.into() })?;
	ensure!(port != 0, PortZeroSnafu);
	Ok(port)
}

/// A listen or connect endpoint: `{tcp|ws|wss|udp}://host:port`.
///
/// An empty host or `*` means "bind all interfaces" when listening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addr {
	pub proto: Proto,
	pub host:  String,
	pub port:  u16,
}

impl Addr {
	/// Host to hand to a socket bind call.
	pub fn bind_host(&self) -> &str {
		if self.host.is_empty() || self.host == "*" { "0.0.0.0" } else { &self.host }
	}

	/// `host:port`, suitable for dialing.
	pub fn authority(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl FromStr for Addr {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (proto, rest) = s.split_once("://").ok_or_else(|| ParseError::AddrSyntax { input: s.into() })?;
		let proto = match proto {
			"tcp" => Proto::Tcp,
			"ws" => Proto::Ws,
			"wss" => Proto::Wss,
			"udp" => Proto::Udp,
			other => return UnknownProtoSnafu { proto: other }.fail(),
		};
		let (host, port) = rest.rsplit_once(':').ok_or_else(|| ParseError::AddrSyntax { input: s.into() })?;
		// Accept `[::1]:port` by stripping the brackets.
		let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
		Ok(Addr {
			proto,
			host: host.to_string(),
			port: parse_port(port)?,
		})
	}
}

impl fmt::Display for Addr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}", self.proto, self.host, self.port)
	}
}

/// Target of a dial issued on behalf of the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
	Domain(String, u16),
	V4(Ipv4Addr, u16),
	V6(Ipv6Addr, u16),
}

impl TargetAddr {
	pub fn port(&self) -> u16 {
		match self {
			TargetAddr::Domain(_, port) | TargetAddr::V4(_, port) | TargetAddr::V6(_, port) => *port,
		}
	}

	/// `host:port`, resolvable by `tokio::net::lookup_host`.
	pub fn authority(&self) -> String {
		match self {
			TargetAddr::Domain(host, port) => format!("{host}:{port}"),
			TargetAddr::V4(ip, port) => format!("{ip}:{port}"),
			TargetAddr::V6(ip, port) => format!("[{ip}]:{port}"),
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.authority())
	}
}

/// One `-L`/`-R` entry.
///
/// Text form is 3 or 4 colon-separated fields with an optional `T:`/`U:`
/// protocol prefix: `[T|U:][bindHost:]bindPort:targetHost:targetPort`.
/// The canonical rendering omits the `T:` prefix and keeps a bind host
/// only when one was given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardSpec {
	pub proto:       FwdProto,
	pub bind_host:   Option<String>,
	pub bind_port:   u16,
	pub target_host: String,
	pub target_port: u16,
}

impl ForwardSpec {
	pub fn bind_host_or_all(&self) -> &str {
		match self.bind_host.as_deref() {
			None | Some("") | Some("*") => "0.0.0.0",
			Some(h) => h,
		}
	}

	pub fn target(&self) -> (String, u16) {
		(self.target_host.clone(), self.target_port)
	}
}

impl FromStr for ForwardSpec {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (proto, rest) = match s.split_once(':') {
			Some(("T", rest)) => (FwdProto::Tcp, rest),
			Some(("U", rest)) => (FwdProto::Udp, rest),
			_ => (FwdProto::Tcp, s),
		};
		let fields: Vec<&str> = rest.split(':').collect();
		let (bind_host, bind_port, target_host, target_port) = match fields.as_slice() {
			[bp, th, tp] => (None, bp, th, tp),
			[bh, bp, th, tp] => (Some(bh.to_string()), bp, th, tp),
			_ => return ForwardSyntaxSnafu { input: s }.fail(),
		};
		ensure!(!target_host.is_empty(), EmptyTargetSnafu { input: s });
		Ok(ForwardSpec {
			proto,
			bind_host,
			bind_port: parse_port(bind_port)?,
			target_host: target_host.to_string(),
			target_port: parse_port(target_port)?,
		})
	}
}

impl fmt::Display for ForwardSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.proto == FwdProto::Udp {
			f.write_str("U:")?;
		}
		if let Some(host) = &self.bind_host {
			write!(f, "{host}:")?;
		}
		write!(f, "{}:{}:{}", self.bind_port, self.target_host, self.target_port)
	}
}

/// The `-D` listen endpoint: `[host:]port`, host defaulting to loopback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksSpec {
	pub host: String,
	pub port: u16,
}

impl FromStr for SocksSpec {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (host, port) = match s.rsplit_once(':') {
			Some((host, port)) => (host, port),
			None => ("127.0.0.1", s),
		};
		ensure!(!host.is_empty(), SocksSyntaxSnafu { input: s });
		Ok(SocksSpec {
			host: host.to_string(),
			port: parse_port(port)?,
		})
	}
}

impl fmt::Display for SocksSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn addr_round_trip() {
		let addr: Addr = "udp://*:12346".parse().unwrap();
		assert_eq!(addr.proto, Proto::Udp);
		assert_eq!(addr.bind_host(), "0.0.0.0");
		assert_eq!(addr.to_string(), "udp://*:12346");

		let addr: Addr = "wss://example.com:443".parse().unwrap();
		assert_eq!(addr.proto, Proto::Wss);
		assert_eq!(addr.authority(), "example.com:443");
	}

	#[test]
	fn addr_rejects_garbage() {
		assert!("example.com:80".parse::<Addr>().is_err());
		assert!("smtp://example.com:25".parse::<Addr>().is_err());
		assert!("tcp://host:0".parse::<Addr>().is_err());
		assert!("tcp://host:70000".parse::<Addr>().is_err());
	}

	/// Every well-formed spec renders back to a canonical equivalent that
	/// parses to the same value.
	#[test]
	fn forward_spec_round_trip() {
		let cases = [
			("8000:127.0.0.1:9000", "8000:127.0.0.1:9000"),
			("T:8000:127.0.0.1:9000", "8000:127.0.0.1:9000"),
			("U:53:10.0.0.1:53", "U:53:10.0.0.1:53"),
			("127.0.0.1:8000:remote:9000", "127.0.0.1:8000:remote:9000"),
			("U:*:69:tftp.lan:69", "U:*:69:tftp.lan:69"),
		];
		for (input, canonical) in cases {
			let spec: ForwardSpec = input.parse().unwrap();
			assert_eq!(spec.to_string(), canonical, "for input {input}");
			let again: ForwardSpec = canonical.parse().unwrap();
			assert_eq!(again, spec);
		}
	}

	#[test]
	fn forward_spec_rejects_malformed() {
		assert!("8000".parse::<ForwardSpec>().is_err());
		assert!("8000:host".parse::<ForwardSpec>().is_err());
		assert!("a:b:c:d:e".parse::<ForwardSpec>().is_err());
		assert!("8000::9000".parse::<ForwardSpec>().is_err());
		assert!("0:host:9000".parse::<ForwardSpec>().is_err());
	}

	#[test]
	fn socks_spec_defaults_to_loopback() {
		let spec: SocksSpec = "1080".parse().unwrap();
		assert_eq!(spec.to_string(), "127.0.0.1:1080");
		let spec: SocksSpec = "0.0.0.0:1080".parse().unwrap();
		assert_eq!(spec.host, "0.0.0.0");
	}
}
