use std::{backtrace::Backtrace, time::Duration};

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
	#[snafu(display("unable to resolve {authority}"))]
	Resolve {
		authority: String,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("no address found for {authority}"))]
	NoAddress {
		authority: String,
		backtrace: Backtrace,
	},
	#[snafu(display("failed to dial {authority}"))]
	Dial {
		authority: String,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("failed to bind {addr}"))]
	Bind {
		addr:      String,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("{op} failed: {message}"))]
	Handshake {
		op:        &'static str,
		message:   String,
		backtrace: Backtrace,
	},
	#[snafu(display("peer failed authentication: {message}"))]
	Auth {
		message:   String,
		backtrace: Backtrace,
	},
	#[snafu(display("{op} timed out after {}ms", timeout.as_millis()))]
	Timeout {
		op:        &'static str,
		timeout:   Duration,
		backtrace: Backtrace,
	},
	#[snafu(display("certificate setup failed"))]
	Certificate {
		source:    crate::cert::CertError,
		backtrace: Backtrace,
	},
	#[snafu(display("cancelled"))]
	Cancelled,
}

/// Run one establishment step under the configured deadline.
///
/// The deadline covers exactly this call; whatever connection state the
/// future produces carries no deadline afterwards.
pub(crate) async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, TransportError>
where
	F: Future<Output = Result<T, TransportError>>,
{
	match tokio::time::timeout(timeout, fut).await {
		Ok(res) => res,
		Err(_) => TimeoutSnafu { op, timeout }.fail(),
	}
}
