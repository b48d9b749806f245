use std::time::Duration;

use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::{
    error::TunnelError,
    tunnel::{
        params::LocalTarget,
        pipe::{self, PipeStats},
        transport::IncomingChannel,
    },
};

/// Owns one forwarded channel: dials the local target and pipes bytes until either
/// side closes.
pub struct ChannelHandler {
    channel: IncomingChannel,
    target: LocalTarget,
    dial_timeout: Duration,
}

impl ChannelHandler {
    pub fn new(channel: IncomingChannel, target: LocalTarget, dial_timeout: Duration) -> Self {
        Self {
            channel,
            target,
            dial_timeout,
        }
    }

    pub fn origin(&self) -> &str {
        &self.channel.origin
    }

    /// Runs to completion. Both ends are closed when this returns, whatever the
    /// outcome. A failed dial is [`TunnelError::LocalDial`].
    pub async fn run(self) -> Result<PipeStats, TunnelError> {
        let Self {
            channel,
            target,
            dial_timeout,
        } = self;
        let mut stream = channel.stream;

        let local = match dial(&target, dial_timeout).await {
            Ok(s) => s,
            Err(source) => {
                let _ = stream.shutdown().await;
                return Err(TunnelError::LocalDial {
                    target: target.to_string(),
                    source,
                });
            }
        };
        let _ = local.set_nodelay(true);

        // `pipe` shuts down both ends and consumes them, so nothing can close twice.
        pipe::pipe(stream, local)
            .await
            .map_err(|source| TunnelError::Channel {
                origin: channel.origin,
                source,
            })
    }
}

async fn dial(target: &LocalTarget, timeout: Duration) -> std::io::Result<TcpStream> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    if timeout.is_zero() {
        return connect.await;
    }
    match tokio::time::timeout(timeout, connect).await {
        Ok(r) => r,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no answer within {}", humantime::format_duration(timeout)),
        )),
    }
}
