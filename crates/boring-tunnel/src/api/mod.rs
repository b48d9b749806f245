//! Control-plane client for the relay's REST API.
//!
//! The forwarding engine only depends on [`ControlPlane`]; [`WebApi`] is the HTTP
//! implementation used by the binary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod web;

pub use web::{WebApi, WebApiOptions};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("token rejected: {0}")]
    Token(String),
    #[error("not authorized: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// True for the kinds derived from a documented HTTP status code.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            ApiError::Token(_)
                | ApiError::Auth(_)
                | ApiError::BadRequest(_)
                | ApiError::MethodNotAllowed(_)
                | ApiError::Server(_)
        )
    }
}

/// A successful control-plane response.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    Json(serde_json::Value),
    /// 200 whose body is not JSON.
    Text(String),
    /// 303 from an endpoint that still answers like a web form.
    Redirect,
}

/// Map an HTTP status and body to the reply or error kind the relay means by it.
pub fn classify_response(status: u16, body: String) -> Result<ApiReply, ApiError> {
    match status {
        200 => match serde_json::from_str(&body) {
            Ok(v) => Ok(ApiReply::Json(v)),
            Err(_) => Ok(ApiReply::Text(body)),
        },
        303 => Ok(ApiReply::Redirect),
        401 => Err(ApiError::Token(body)),
        403 => Err(ApiError::Auth(body)),
        400 => Err(ApiError::BadRequest(body)),
        405 | 406 => Err(ApiError::MethodNotAllowed(body)),
        500 => Err(ApiError::Server(body)),
        status => Err(ApiError::UnexpectedStatus { status, body }),
    }
}

/// Relay-side record for one tunnel, as returned by `GET /api/tunnels`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    /// Filled from the map key when the relay leaves it out.
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub server_public_key: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tunnel_port: u32,
    #[serde(default)]
    pub tunnel_private_key: String,
    #[serde(default)]
    pub client_address: String,
    #[serde(default)]
    pub client_port: u16,
    #[serde(default)]
    pub allow_external_tcp: bool,
    #[serde(default)]
    pub tls_termination: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default)]
    pub auth_password: String,
    #[serde(default)]
    pub ssh_key_id: String,
}

/// Parameters for creating a tunnel. Empty strings mean "let the relay decide".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateTunnel {
    pub owner: String,
    pub ssh_key_id: String,
    pub client_name: String,
    pub client_addr: String,
    pub client_port: u16,
    pub allow_external_tcp: bool,
    pub password_protect: bool,
    pub username: String,
    pub password: String,
    pub tls_termination: String,
    pub extra: BTreeMap<String, String>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Tunnels assigned to `client_name` keyed by domain. An empty name lists all.
    async fn list_tunnels(
        &self,
        client_name: &str,
    ) -> Result<BTreeMap<String, TunnelDescriptor>, ApiError>;
    async fn create_tunnel(&self, domain: &str, req: &CreateTunnel) -> Result<(), ApiError>;
    async fn delete_tunnel(&self, domain: &str) -> Result<(), ApiError>;
    async fn register_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError>;
    async fn deregister_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError>;
}

/// Qualify `name` with the admin domain unless it already is.
pub fn qualify_domain(name: &str, admin_domain: &str) -> String {
    let name = name.trim();
    let admin_domain = admin_domain.trim().trim_start_matches('.');
    if admin_domain.is_empty() || name.contains(&format!(".{admin_domain}")) {
        return name.to_string();
    }
    format!("{name}.{admin_domain}")
}

pub(crate) fn parse_tunnel_map(
    reply: ApiReply,
) -> Result<BTreeMap<String, TunnelDescriptor>, ApiError> {
    match reply {
        ApiReply::Json(serde_json::Value::Null) => Ok(BTreeMap::new()),
        ApiReply::Json(v) => {
            let mut map: BTreeMap<String, TunnelDescriptor> = serde_json::from_value(v)
                .map_err(|e| ApiError::Protocol(format!("tunnel list: {e}")))?;
            // Older relays leave `domain` out of the record itself.
            for (k, d) in map.iter_mut() {
                if d.domain.is_empty() {
                    d.domain = k.clone();
                }
            }
            Ok(map)
        }
        ApiReply::Text(t) => Err(ApiError::Protocol(format!(
            "tunnel list: expected JSON object, got {:?}",
            truncate(&t, 64)
        ))),
        ApiReply::Redirect => Err(ApiError::Protocol(
            "tunnel list: unexpected redirect".into(),
        )),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
