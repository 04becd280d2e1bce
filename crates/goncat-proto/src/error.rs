use std::{backtrace::Backtrace, string::FromUtf8Error};

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtoError {
	#[snafu(display("unknown job tag {value}"))]
	UnknownJobTag {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("unknown forward protocol {value}"))]
	UnknownFwdProto {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("unknown address type {value}"))]
	UnknownAddressType {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("record of {len} bytes exceeds the {max} byte limit"))]
	RecordTooLarge {
		len:       usize,
		max:       usize,
		backtrace: Backtrace,
	},
	#[snafu(display("record ends before its fields do"))]
	Truncated {
		backtrace: Backtrace,
	},
	#[snafu(display("record carries {extra} bytes after its last field"))]
	TrailingBytes {
		extra:     usize,
		backtrace: Backtrace,
	},
	#[snafu(display("string field is not valid UTF-8"))]
	InvalidString {
		source:    FromUtf8Error,
		backtrace: Backtrace,
	},
	#[snafu(display("datagram of {len} bytes does not fit a u16 frame"))]
	OversizedDatagram {
		len:       usize,
		backtrace: Backtrace,
	},
	// Caller should yield
	BytesRemaining,
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for ProtoError {
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		IoSnafu.into_error(source)
	}
}
