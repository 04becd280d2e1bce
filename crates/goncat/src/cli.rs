use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "goncat", version, about, long_about = None)]
pub struct Cli {
	#[command(subcommand)]
	pub role: Role,
}

#[derive(Subcommand)]
pub enum Role {
	/// Operate the remote end: post jobs, consume their output
	Master {
		#[command(subcommand)]
		mode: MasterMode,
	},
	/// Be operated: execute the peer's jobs
	Slave {
		#[command(subcommand)]
		mode: SlaveMode,
	},
}

#[derive(Subcommand)]
pub enum MasterMode {
	/// Wait for the slave to connect
	Listen {
		#[command(flatten)]
		shared: SharedArgs,
		#[command(flatten)]
		master: MasterArgs,
	},
	/// Connect out to a listening slave
	Connect {
		#[command(flatten)]
		shared: SharedArgs,
		#[command(flatten)]
		master: MasterArgs,
	},
}

#[derive(Subcommand)]
pub enum SlaveMode {
	/// Wait for the master to connect
	Listen {
		#[command(flatten)]
		shared: SharedArgs,
		#[command(flatten)]
		slave:  SlaveArgs,
	},
	/// Connect out to a listening master
	Connect {
		#[command(flatten)]
		shared: SharedArgs,
		#[command(flatten)]
		slave:  SlaveArgs,
	},
}

#[derive(Args)]
pub struct SharedArgs {
	/// Peer address: `{tcp|ws|wss|udp}://host:port` (`*` binds all)
	#[arg(value_name = "ADDRESS")]
	pub address: String,

	/// Upgrade the connection with TLS
	#[arg(long)]
	pub ssl: bool,

	/// Pre-shared secret for mutual authentication (requires --ssl)
	#[arg(long, value_name = "SECRET")]
	pub key: Option<String>,

	/// Connect and handshake timeout
	#[arg(long, value_name = "DURATION", default_value = "10s", value_parser = humantime::parse_duration)]
	pub timeout: Duration,

	/// More log output (-v debug, -vv trace)
	#[arg(short, long, action = ArgAction::Count)]
	pub verbose: u8,
}

#[derive(Args)]
pub struct MasterArgs {
	/// Program the slave executes for the interactive session
	#[arg(long, value_name = "PROGRAM")]
	pub exec: Option<String>,

	/// Run the program on a pseudo-terminal (requires --exec)
	#[arg(long)]
	pub pty: bool,

	/// Append the session's remote output to FILE
	#[arg(long, value_name = "FILE")]
	pub log: Option<PathBuf>,

	/// Local forward: `[T|U:][bindHost:]bindPort:targetHost:targetPort`
	#[arg(short = 'L', value_name = "SPEC", action = ArgAction::Append)]
	pub local: Vec<String>,

	/// Remote forward, same syntax read from the slave's side
	#[arg(short = 'R', value_name = "SPEC", action = ArgAction::Append)]
	pub remote: Vec<String>,

	/// SOCKS5 proxy on `[host:]port` (host defaults to 127.0.0.1)
	#[arg(short = 'D', value_name = "ADDR")]
	pub socks: Option<String>,
}

#[derive(Args)]
pub struct SlaveArgs {
	/// Best-effort removal of this binary on exit
	#[arg(long)]
	pub cleanup: bool,
}
