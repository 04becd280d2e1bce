use std::{
	io::IsTerminal as _,
	process::ExitCode,
	sync::{Arc, Mutex},
};

use clap::Parser as _;
use goncat_core::{PeerConn, sem::TimedSemaphore};
use goncat_session::{
	MasterConfig, SlaveConfig,
	master::{OperatorIo, run_master},
	slave::run_slave,
};
use goncat_transport::{ConnHandler, tls};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
	cli::{Cli, MasterMode, Role, SlaveMode},
	conf::SharedConfig,
};

mod cleanup;
mod cli;
mod conf;
mod log;

enum Failure {
	Config(Vec<String>),
	Runtime(eyre::Report),
}

#[tokio::main]
async fn main() -> ExitCode {
	match dispatch().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(Failure::Config(problems)) => {
			for problem in problems {
				eprintln!("goncat: {problem}");
			}
			ExitCode::from(2)
		}
		Err(Failure::Runtime(report)) => {
			error!(target: "[MAIN]", "{report:#}");
			ExitCode::FAILURE
		}
	}
}

async fn dispatch() -> Result<(), Failure> {
	let cli = Cli::parse();
	match cli.role {
		Role::Master { mode } => {
			let (listen, shared_args, master_args) = match mode {
				MasterMode::Listen { shared, master } => (true, shared, master),
				MasterMode::Connect { shared, master } => (false, shared, master),
			};
			let (shared_cfg, master_cfg) = conf::master(&shared_args, &master_args).map_err(Failure::Config)?;
			init(&shared_cfg).map_err(Failure::Runtime)?;
			let res = if listen {
				master_listen(shared_cfg, master_cfg).await
			} else {
				master_connect(shared_cfg, master_cfg).await
			};
			res.map_err(Failure::Runtime)
		}
		Role::Slave { mode } => {
			let (listen, shared_args, slave_args) = match mode {
				SlaveMode::Listen { shared, slave } => (true, shared, slave),
				SlaveMode::Connect { shared, slave } => (false, shared, slave),
			};
			let (shared_cfg, cleanup) = conf::slave(&shared_args, &slave_args).map_err(Failure::Config)?;
			init(&shared_cfg).map_err(Failure::Runtime)?;
			let res = if listen {
				slave_listen(shared_cfg).await
			} else {
				slave_connect(shared_cfg).await
			};
			if cleanup {
				cleanup::self_delete();
			}
			res.map_err(Failure::Runtime)
		}
	}
}

fn init(shared: &SharedConfig) -> eyre::Result<()> {
	log::init_log(shared.verbose)?;
	tls::init_crypto();
	Ok(())
}

/// Root token cancelled by the first interrupt.
fn interruptible_root() -> CancellationToken {
	let root = CancellationToken::new();
	let trigger = root.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!(target: "[MAIN]", "interrupted, shutting down");
			trigger.cancel();
		}
	});
	root
}

/// The operator's real stdio; raw mode only when both ends are a tty.
fn operator_stdio() -> OperatorIo {
	let raw = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
	OperatorIo {
		input:        Box::new(tokio::io::stdin()),
		output:       Box::new(tokio::io::stdout()),
		raw_terminal: raw,
	}
}

async fn master_connect(shared: SharedConfig, cfg: MasterConfig) -> eyre::Result<()> {
	let root = interruptible_root();
	let conn = goncat_transport::dial(&shared.addr, shared.timeout).await?;
	let conn = if shared.app_tls() {
		tls::upgrade_client(conn, shared.tls_key(), shared.timeout).await?
	} else {
		conn
	};
	let sem = TimedSemaphore::new(1, shared.timeout);
	run_master(conn, Arc::new(cfg), operator_stdio(), sem, root).await
}

/// Master listening: serve until the first session completes (the
/// operator's interaction is the invocation), then report its outcome.
struct MasterEnd {
	shared:  SharedConfig,
	cfg:     Arc<MasterConfig>,
	sem:     TimedSemaphore,
	root:    CancellationToken,
	outcome: Arc<Mutex<Option<eyre::Report>>>,
}

impl ConnHandler for MasterEnd {
	async fn handle(&self, conn: PeerConn) -> eyre::Result<()> {
		let upgraded = if self.shared.app_tls() {
			tls::upgrade_server(conn, self.shared.tls_key(), self.shared.timeout).await
		} else {
			Ok(conn)
		};
		let res = match upgraded {
			Ok(conn) => {
				run_master(
					conn,
					self.cfg.clone(),
					operator_stdio(),
					self.sem.clone(),
					self.root.child_token(),
				)
				.await
			}
			Err(err) => Err(err.into()),
		};
		if let Err(err) = &res {
			self.outcome.lock().expect("not poisoned").get_or_insert(eyre::eyre!("{err:#}"));
		}
		self.root.cancel();
		res
	}
}

async fn master_listen(shared: SharedConfig, cfg: MasterConfig) -> eyre::Result<()> {
	let root = interruptible_root();
	let outcome = Arc::new(Mutex::new(None));
	let handler = Arc::new(MasterEnd {
		shared:  shared.clone(),
		cfg:     Arc::new(cfg),
		sem:     TimedSemaphore::new(1, shared.timeout),
		root:    root.clone(),
		outcome: outcome.clone(),
	});
	goncat_transport::listen_and_serve(&shared.addr, shared.timeout, handler, root).await?;
	match outcome.lock().expect("not poisoned").take() {
		Some(report) => Err(report),
		None => Ok(()),
	}
}

async fn slave_connect(shared: SharedConfig) -> eyre::Result<()> {
	let root = interruptible_root();
	let conn = goncat_transport::dial(&shared.addr, shared.timeout).await?;
	let conn = if shared.app_tls() {
		tls::upgrade_client(conn, shared.tls_key(), shared.timeout).await?
	} else {
		conn
	};
	run_slave(
		conn,
		SlaveConfig {
			timeout: shared.timeout,
		},
		root,
	)
	.await
}

/// Slave listening: serve sessions until interrupted.
struct SlaveEnd {
	shared: SharedConfig,
	root:   CancellationToken,
}

impl ConnHandler for SlaveEnd {
	async fn handle(&self, conn: PeerConn) -> eyre::Result<()> {
		let conn = if self.shared.app_tls() {
			tls::upgrade_server(conn, self.shared.tls_key(), self.shared.timeout).await?
		} else {
			conn
		};
		run_slave(
			conn,
			SlaveConfig {
				timeout: self.shared.timeout,
			},
			self.root.child_token(),
		)
		.await
	}
}

async fn slave_listen(shared: SharedConfig) -> eyre::Result<()> {
	let root = interruptible_root();
	let handler = Arc::new(SlaveEnd {
		shared: shared.clone(),
		root:   root.clone(),
	});
	goncat_transport::listen_and_serve(&shared.addr, shared.timeout, handler, root).await?;
	Ok(())
}
