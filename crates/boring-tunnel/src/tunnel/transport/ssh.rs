//! SSH relay transport built on `russh`.
//!
//! The relay opens one `forwarded-tcpip` channel per public connection. The client
//! handler callback pushes each into a bounded queue that
//! [`RelaySession::accept_channel`] drains.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use russh::{
    Channel, Disconnect,
    client::{self, Handle, Msg, Session},
};
use russh_keys::key;
use tokio::sync::{Mutex, mpsc};

use crate::{
    error::TunnelError,
    tunnel::{
        params::ConnectionParameters,
        transport::{IncomingChannel, RelaySession, RelayTransport},
    },
};

const INCOMING_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct SshTransportOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Refuse relays whose host key differs from the one the control plane published.
    /// When the control plane publishes none, any key is accepted.
    pub strict_host_key: bool,
}

impl Default for SshTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            strict_host_key: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    opts: SshTransportOptions,
}

impl SshTransport {
    pub fn new(opts: SshTransportOptions) -> Self {
        Self { opts }
    }
}

struct RelayHandler {
    incoming: mpsc::Sender<IncomingChannel>,
    expected_key: Option<key::PublicKey>,
    strict_host_key: bool,
}

#[async_trait]
impl client::Handler for RelayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.expected_key else {
            tracing::debug!("ssh: relay publishes no host key; accepting");
            return Ok(true);
        };
        if expected.fingerprint() == server_public_key.fingerprint() {
            return Ok(true);
        }
        if self.strict_host_key {
            tracing::warn!(
                expected = %expected.fingerprint(),
                got = %server_public_key.fingerprint(),
                "ssh: relay host key mismatch"
            );
            return Ok(false);
        }
        tracing::warn!(
            got = %server_public_key.fingerprint(),
            "ssh: relay host key mismatch; accepting (strict_host_key = false)"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ch = IncomingChannel {
            stream: Box::new(channel.into_stream()),
            connected: format!("{connected_address}:{connected_port}"),
            origin: format!("{originator_address}:{originator_port}"),
        };
        // A full queue or a gone session drops the channel, which closes it.
        if let Err(err) = self.incoming.try_send(ch) {
            tracing::warn!(err = %err, "ssh: dropping forwarded channel");
        }
        Ok(())
    }
}

/// Parse an `authorized_keys` style line (`ssh-ed25519 AAAA... comment`) or a bare
/// base64 blob.
fn parse_host_key(line: &str) -> Option<key::PublicKey> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    let blob = if first.starts_with("ssh-") || first.starts_with("ecdsa-") {
        parts.next()?
    } else {
        first
    };
    russh_keys::parse_public_key_base64(blob).ok()
}

#[async_trait]
impl RelayTransport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn RelaySession>, TunnelError> {
        let addr = params.relay_addr();

        let expected_key = match params.relay_public_key.as_deref() {
            Some(line) => {
                let k = parse_host_key(line);
                if k.is_none() {
                    tracing::warn!(relay = %addr, "ssh: unparseable relay host key; not pinning");
                }
                k
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let handler = RelayHandler {
            incoming: tx,
            expected_key,
            strict_host_key: self.opts.strict_host_key,
        };

        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.opts.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        });

        let connect = client::connect(config, addr.as_str(), handler);
        let mut handle = tokio::time::timeout(self.opts.connect_timeout, connect)
            .await
            .map_err(|_| TunnelError::Connect {
                addr: addr.clone(),
                reason: format!(
                    "timed out after {}",
                    humantime::format_duration(self.opts.connect_timeout)
                ),
            })?
            .map_err(|e| TunnelError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let ok = handle
            .authenticate_publickey(params.relay_username.clone(), params.private_key.key_pair())
            .await
            .map_err(|e| TunnelError::Connect {
                addr: addr.clone(),
                reason: format!("authentication exchange: {e}"),
            })?;
        if !ok {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "")
                .await;
            return Err(TunnelError::Authentication {
                user: params.relay_username.clone(),
            });
        }

        tracing::debug!(relay = %addr, user = %params.relay_username, "ssh: authenticated");

        Ok(Arc::new(SshSession {
            handle: Mutex::new(handle),
            incoming: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SshSession {
    handle: Mutex<Handle<RelayHandler>>,
    incoming: Mutex<mpsc::Receiver<IncomingChannel>>,
    closed: AtomicBool,
}

#[async_trait]
impl RelaySession for SshSession {
    async fn request_forward(&self, bind_addr: &str, port: u32) -> Result<u32, TunnelError> {
        let mut h = self.handle.lock().await;
        let assigned = h
            .tcpip_forward(bind_addr, port)
            .await
            .map_err(|e| map_russh(e, "tcpip-forward"))?;
        // The relay reports a port only when it picked one (port 0).
        Ok(if port == 0 { assigned } else { port })
    }

    async fn cancel_forward(&self, bind_addr: &str, port: u32) -> Result<(), TunnelError> {
        let h = self.handle.lock().await;
        h.cancel_tcpip_forward(bind_addr, port)
            .await
            .map_err(|e| map_russh(e, "cancel-tcpip-forward"))?;
        Ok(())
    }

    async fn accept_channel(&self) -> Result<IncomingChannel, TunnelError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TunnelError::TransportClosed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let h = self.handle.lock().await;
        let _ = h.disconnect(Disconnect::ByApplication, "", "").await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn map_russh(err: russh::Error, what: &str) -> TunnelError {
    match err {
        russh::Error::Disconnect | russh::Error::SendError | russh::Error::HUP => {
            TunnelError::TransportClosed
        }
        other => TunnelError::RemoteProtocol(format!("ssh {what}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_line_parses_with_or_without_type() {
        let blob = "AAAAC3NzaC1lZDI1NTE5AAAAILoNSS8LobhH4HeoeYANzvfw/+kQkjKBmul8vG1JbyJa";
        let a = parse_host_key(&format!("ssh-ed25519 {blob} relay")).unwrap();
        let b = parse_host_key(blob).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(parse_host_key("ssh-ed25519").is_none());
        assert!(parse_host_key("").is_none());
    }

    #[test]
    fn default_options_pin_host_key() {
        let o = SshTransportOptions::default();
        assert!(o.strict_host_key);
        assert_eq!(o.connect_timeout, Duration::from_secs(10));
    }
}
