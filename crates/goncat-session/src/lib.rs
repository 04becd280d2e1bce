//! Session layer: the job board on the control stream, the master and
//! slave session loops, and the service handlers they spawn.

mod config;
pub use config::*;

mod error;
pub use error::*;

mod jobboard;
pub use jobboard::*;

mod udp;

pub mod master;
pub mod slave;

use std::net::SocketAddr;

use goncat_core::types::TargetAddr;

/// Resolve a dial target to one socket address.
pub(crate) async fn resolve_target(target: &TargetAddr) -> std::io::Result<SocketAddr> {
	match target {
		TargetAddr::V4(ip, port) => Ok(SocketAddr::from((*ip, *port))),
		TargetAddr::V6(ip, port) => Ok(SocketAddr::from((*ip, *port))),
		TargetAddr::Domain(host, port) => {
			let mut addrs = tokio::net::lookup_host((host.as_str(), *port)).await?;
			addrs
				.next()
				.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {host}")))
		}
	}
}
