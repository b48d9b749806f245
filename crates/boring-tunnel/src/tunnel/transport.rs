use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::TunnelError, tunnel::params::ConnectionParameters};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// A logical channel the relay opened towards us for one forwarded connection.
pub struct IncomingChannel {
    pub stream: BoxedStream,
    /// Address and port the relay accepted the connection on.
    pub connected: String,
    /// Remote peer of the forwarded connection. Diagnostic only.
    pub origin: String,
}

impl std::fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("connected", &self.connected)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Connect and authenticate. Network failures are [`TunnelError::Connect`],
    /// a rejected login is [`TunnelError::Authentication`].
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn RelaySession>, TunnelError>;
}

#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Ask the relay to listen on `bind_addr:port` and forward to us. Returns the
    /// port the relay actually bound.
    async fn request_forward(&self, bind_addr: &str, port: u32) -> Result<u32, TunnelError>;
    async fn cancel_forward(&self, bind_addr: &str, port: u32) -> Result<(), TunnelError>;
    /// Next forwarded channel. Fails with [`TunnelError::TransportClosed`] once the
    /// connection is gone. Must be cancel safe.
    async fn accept_channel(&self) -> Result<IncomingChannel, TunnelError>;
    async fn close(&self);
    /// True once `close` ran or the connection went away on its own.
    fn is_closed(&self) -> bool;
}

pub mod ssh;
