pub mod pipe;
pub mod sem;
pub mod types;

use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any reliable ordered byte stream a session can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

/// An established peer connection, transport-erased.
pub type PeerConn = Box<dyn PeerStream>;
