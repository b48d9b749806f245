use std::sync::Arc;

use russh_keys::key::KeyPair;

use crate::{api::TunnelDescriptor, error::TunnelError};

/// Decoded private key. Debug output never shows key material.
#[derive(Clone)]
pub struct PrivateKey(Arc<KeyPair>);

impl PrivateKey {
    pub fn decode(pem: &str) -> Result<Self, TunnelError> {
        if pem.trim().is_empty() {
            return Err(TunnelError::InvalidKey("missing private key".into()));
        }
        let kp = russh_keys::decode_secret_key(pem, None)
            .map_err(|e| TunnelError::InvalidKey(e.to_string()))?;
        Ok(Self(Arc::new(kp)))
    }

    pub fn key_pair(&self) -> Arc<KeyPair> {
        self.0.clone()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

impl LocalTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if host.trim().is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.trim().to_string()
        };
        Self { host, port }
    }
}

impl std::fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything needed to bring up one forwarding session.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_username: String,
    pub private_key: PrivateKey,
    /// Relay host key in `authorized_keys` form, when the relay publishes one.
    pub relay_public_key: Option<String>,
    pub remote_port: u32,
    pub local: LocalTarget,
}

impl ConnectionParameters {
    pub fn from_descriptor(desc: &TunnelDescriptor, local: LocalTarget) -> Result<Self, TunnelError> {
        if desc.server_address.trim().is_empty() {
            return Err(TunnelError::RemoteProtocol(format!(
                "tunnel {:?} has no server_address",
                desc.domain
            )));
        }
        let private_key = PrivateKey::decode(&desc.tunnel_private_key)?;
        let relay_public_key = Some(desc.server_public_key.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        Ok(Self {
            relay_host: desc.server_address.trim().to_string(),
            relay_port: if desc.server_port == 0 { 22 } else { desc.server_port },
            relay_username: desc.username.trim().to_string(),
            private_key,
            relay_public_key,
            remote_port: desc.tunnel_port,
            local,
        })
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }
}
