//! Turn parsed flags into validated runtime configuration. Every
//! problem is collected so the operator sees the full list at once,
//! before any socket is touched.

use std::time::Duration;

use goncat_core::types::{Addr, ForwardSpec, Proto, SocksSpec};
use goncat_session::MasterConfig;

use crate::cli::{MasterArgs, SharedArgs, SlaveArgs};

#[derive(Clone, Debug)]
pub struct SharedConfig {
	pub addr:    Addr,
	pub ssl:     bool,
	pub key:     Option<String>,
	pub timeout: Duration,
	pub verbose: u8,
}

impl SharedConfig {
	/// The pre-shared key, only when TLS is actually in play.
	pub fn tls_key(&self) -> Option<&str> {
		self.key.as_deref()
	}

	/// Whether the application-layer TLS upgrade applies: never for
	/// udp://, whose QUIC handshake already encrypts.
	pub fn app_tls(&self) -> bool {
		self.ssl && self.addr.proto != Proto::Udp
	}
}

pub fn shared(args: &SharedArgs, problems: &mut Vec<String>) -> Option<SharedConfig> {
	let addr = match args.address.parse::<Addr>() {
		Ok(addr) => Some(addr),
		Err(err) => {
			problems.push(err.to_string());
			None
		}
	};
	if args.key.as_deref().is_some_and(str::is_empty) {
		problems.push("--key must not be empty".to_string());
	}
	if args.key.is_some() && !args.ssl {
		problems.push("--key requires --ssl".to_string());
	}
	if let Some(addr) = &addr {
		if args.ssl && addr.proto == Proto::Udp {
			problems.push("--ssl does not apply to udp:// (QUIC always encrypts; use --key on tcp/ws/wss)".to_string());
		}
	}
	if args.timeout.is_zero() {
		problems.push("--timeout must be positive".to_string());
	}
	let addr = addr?;
	Some(SharedConfig {
		addr,
		ssl: args.ssl,
		key: args.key.clone(),
		timeout: args.timeout,
		verbose: args.verbose,
	})
}

pub fn master(shared_args: &SharedArgs, args: &MasterArgs) -> Result<(SharedConfig, MasterConfig), Vec<String>> {
	let mut problems = Vec::new();
	let shared_cfg = shared(shared_args, &mut problems);

	if args.pty && args.exec.is_none() {
		problems.push("--pty requires --exec".to_string());
	}
	let mut local_forwards = Vec::new();
	for spec in &args.local {
		match spec.parse::<ForwardSpec>() {
			Ok(spec) => local_forwards.push(spec),
			Err(err) => problems.push(format!("-L {spec}: {err}")),
		}
	}
	let mut remote_forwards = Vec::new();
	for spec in &args.remote {
		match spec.parse::<ForwardSpec>() {
			Ok(spec) => remote_forwards.push(spec),
			Err(err) => problems.push(format!("-R {spec}: {err}")),
		}
	}
	let socks = match &args.socks {
		Some(spec) => match spec.parse::<SocksSpec>() {
			Ok(spec) => Some(spec),
			Err(err) => {
				problems.push(format!("-D {spec}: {err}"));
				None
			}
		},
		None => None,
	};

	if !problems.is_empty() {
		return Err(problems);
	}
	let shared_cfg = shared_cfg.expect("no problems recorded");
	let master_cfg = MasterConfig {
		exec: args.exec.clone(),
		pty: args.pty,
		log_file: args.log.clone(),
		local_forwards,
		remote_forwards,
		socks,
		timeout: shared_cfg.timeout,
	};
	Ok((shared_cfg, master_cfg))
}

pub fn slave(shared_args: &SharedArgs, args: &SlaveArgs) -> Result<(SharedConfig, bool), Vec<String>> {
	let mut problems = Vec::new();
	let shared_cfg = shared(shared_args, &mut problems);
	if !problems.is_empty() {
		return Err(problems);
	}
	Ok((shared_cfg.expect("no problems recorded"), args.cleanup))
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use crate::cli::{MasterArgs, SharedArgs, SlaveArgs};

	fn shared_args(address: &str) -> SharedArgs {
		SharedArgs {
			address: address.to_string(),
			ssl:     false,
			key:     None,
			timeout: Duration::from_secs(10),
			verbose: 0,
		}
	}

	fn master_args() -> MasterArgs {
		MasterArgs {
			exec:   None,
			pty:    false,
			log:    None,
			local:  Vec::new(),
			remote: Vec::new(),
			socks:  None,
		}
	}

	#[test]
	fn key_requires_ssl() {
		let mut args = shared_args("tcp://127.0.0.1:4444");
		args.key = Some("correcthorse".to_string());
		let err = super::slave(&args, &SlaveArgs { cleanup: false }).unwrap_err();
		assert!(err.iter().any(|p| p.contains("--key requires --ssl")));
	}

	#[test]
	fn ssl_on_udp_is_rejected() {
		let mut args = shared_args("udp://127.0.0.1:4444");
		args.ssl = true;
		let err = super::slave(&args, &SlaveArgs { cleanup: false }).unwrap_err();
		assert!(err.iter().any(|p| p.contains("udp://")));
	}

	#[test]
	fn pty_requires_exec() {
		let shared = shared_args("tcp://*:4444");
		let mut args = master_args();
		args.pty = true;
		let err = super::master(&shared, &args).unwrap_err();
		assert!(err.iter().any(|p| p.contains("--pty requires --exec")));
	}

	#[test]
	fn every_problem_is_reported() {
		let mut shared = shared_args("smtp://nope:99999");
		shared.key = Some(String::new());
		let mut args = master_args();
		args.local = vec!["not-a-spec".to_string()];
		args.socks = Some("bad:".to_string());
		let err = super::master(&shared, &args).unwrap_err();
		assert!(err.len() >= 3, "got: {err:?}");
	}

	#[test]
	fn well_formed_master_config() {
		let shared = shared_args("tcp://127.0.0.1:12345");
		let mut args = master_args();
		args.exec = Some("/bin/sh".to_string());
		args.local = vec!["8000:127.0.0.1:9000".to_string()];
		args.remote = vec!["8080:localhost:9090".to_string()];
		args.socks = Some("1080".to_string());
		let (shared_cfg, master_cfg) = super::master(&shared, &args).unwrap();
		assert!(shared_cfg.app_tls() == false);
		assert_eq!(master_cfg.local_forwards.len(), 1);
		assert_eq!(master_cfg.remote_forwards.len(), 1);
		assert_eq!(master_cfg.socks.as_ref().unwrap().to_string(), "127.0.0.1:1080");
	}
}
