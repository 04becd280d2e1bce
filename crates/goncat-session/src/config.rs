use std::{collections::HashMap, path::PathBuf, time::Duration};

use goncat_core::types::{ForwardSpec, FwdProto, SocksSpec};

/// Master-side session configuration, frozen before the first handshake.
#[derive(Clone, Debug)]
pub struct MasterConfig {
	/// Program the slave runs for the interactive shell; no shell job is
	/// posted when unset.
	pub exec:            Option<String>,
	pub pty:             bool,
	/// Append-only transcript of the shell's remote output.
	pub log_file:        Option<PathBuf>,
	pub local_forwards:  Vec<ForwardSpec>,
	pub remote_forwards: Vec<ForwardSpec>,
	pub socks:           Option<SocksSpec>,
	pub timeout:         Duration,
}

#[derive(Clone, Debug)]
pub struct SlaveConfig {
	pub timeout: Duration,
}

/// The remote-forward targets this master agreed to dial, frozen at
/// config load. Inbound notifications for any other tuple are refused
/// without dialing.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
	targets: HashMap<(String, u16), FwdProto>,
}

impl AllowList {
	pub fn from_forwards(specs: &[ForwardSpec]) -> Self {
		let targets = specs
			.iter()
			.map(|spec| ((spec.target_host.clone(), spec.target_port), spec.proto))
			.collect();
		Self { targets }
	}

	/// The forward protocol registered for this tuple, if any.
	pub fn permits(&self, host: &str, port: u16) -> Option<FwdProto> {
		self.targets.get(&(host.to_string(), port)).copied()
	}

	pub fn is_empty(&self) -> bool {
		self.targets.is_empty()
	}
}

#[cfg(test)]
mod test {
	use goncat_core::types::{ForwardSpec, FwdProto};

	use super::AllowList;

	#[test]
	fn allow_list_tracks_registered_targets_only() {
		let specs: Vec<ForwardSpec> = vec![
			"8080:localhost:9090".parse().unwrap(),
			"U:53:10.0.0.1:53".parse().unwrap(),
		];
		let allow = AllowList::from_forwards(&specs);
		assert_eq!(allow.permits("localhost", 9090), Some(FwdProto::Tcp));
		assert_eq!(allow.permits("10.0.0.1", 53), Some(FwdProto::Udp));
		assert_eq!(allow.permits("localhost", 9091), None);
		assert_eq!(allow.permits("evil.example", 9090), None);
	}
}
