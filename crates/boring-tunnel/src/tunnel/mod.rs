//! Reverse tunnel engine: the relay opens channels, we forward them to a local
//! TCP target.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    api::{CreateTunnel, qualify_domain},
    tunnel::params::LocalTarget,
};

pub mod controller;
pub mod handler;
pub mod params;
pub mod pipe;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ControllerOptions, RunningTunnel, TunnelController};

/// The tunnel a caller wants to exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelSpec {
    pub subdomain: String,
    /// Empty means the API user.
    pub owner: String,
    pub ssh_key_id: String,
    pub client_addr: String,
    pub client_port: u16,
    pub allow_external_tcp: bool,
    pub password_protect: bool,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub tls_termination: String,
    pub extra: BTreeMap<String, String>,
}

impl TunnelSpec {
    pub fn new(subdomain: impl Into<String>, client_port: u16) -> Self {
        Self {
            subdomain: subdomain.into(),
            owner: String::new(),
            ssh_key_id: String::new(),
            client_addr: "127.0.0.1".into(),
            client_port,
            allow_external_tcp: false,
            password_protect: false,
            username: String::new(),
            password: String::new(),
            tls_termination: "server".into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn domain(&self, admin_domain: &str) -> String {
        qualify_domain(&self.subdomain, admin_domain)
    }

    pub fn local_target(&self) -> LocalTarget {
        LocalTarget::new(self.client_addr.clone(), self.client_port)
    }

    pub fn to_create_request(&self, client_name: &str) -> CreateTunnel {
        CreateTunnel {
            owner: self.owner.clone(),
            ssh_key_id: self.ssh_key_id.clone(),
            client_name: client_name.to_string(),
            client_addr: self.client_addr.clone(),
            client_port: self.client_port,
            allow_external_tcp: self.allow_external_tcp,
            password_protect: self.password_protect,
            username: self.username.clone(),
            password: self.password.clone(),
            tls_termination: self.tls_termination.clone(),
            extra: self.extra.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_and_qualification() {
        let s = TunnelSpec::new("app", 8080);
        assert_eq!(s.domain("bp.example.com"), "app.bp.example.com");
        assert_eq!(s.local_target().to_string(), "127.0.0.1:8080");

        let mut q = TunnelSpec::new("app.bp.example.com", 8080);
        q.client_addr = String::new();
        assert_eq!(q.domain("bp.example.com"), "app.bp.example.com");
        assert_eq!(q.local_target().host, "127.0.0.1");

        let req = s.to_create_request("laptop");
        assert_eq!(req.client_name, "laptop");
        assert_eq!(req.tls_termination, "server");
        assert_eq!(req.client_port, 8080);
    }
}
