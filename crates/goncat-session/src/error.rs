use std::backtrace::Backtrace;

use goncat_proto::JobTag;
use snafu::prelude::*;

/// Session-fatal failures. Everything handler-scoped (dial failures,
/// stream I/O, semaphore refusals) is logged and contained instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
	#[snafu(display("protocol violation on the control stream"))]
	Protocol {
		source:    goncat_proto::ProtoError,
		backtrace: Backtrace,
	},
	#[snafu(display("job {tag:?} is not valid on this side of the session"))]
	UnexpectedJob {
		tag:       JobTag,
		backtrace: Backtrace,
	},
	#[snafu(display("session multiplexer failed"))]
	Mux {
		source:    goncat_mux::MuxError,
		backtrace: Backtrace,
	},
	#[snafu(display("control stream closed while posting a job"))]
	ControlClosed {
		backtrace: Backtrace,
	},
}
