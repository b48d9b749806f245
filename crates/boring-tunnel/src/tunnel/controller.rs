//! Tunnel lifecycle: make sure the relay knows the tunnel, then run a forwarding
//! session for it. Teardown is always explicit.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::{
    api::{ControlPlane, qualify_domain},
    error::TunnelError,
    tunnel::{
        TunnelSpec,
        params::ConnectionParameters,
        session::{ForwardingSession, SessionOptions, SessionState, SessionStats},
        transport::RelayTransport,
    },
};

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    pub client_name: String,
    pub admin_domain: String,
    pub session: SessionOptions,
}

/// Snapshot of one tunnel this controller runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTunnel {
    pub domain: String,
    pub remote_port: Option<u32>,
    pub local: String,
    pub state: SessionState,
    /// False once the relay connection is gone.
    pub live: bool,
    pub stats: SessionStats,
}

struct Registration {
    params: ConnectionParameters,
    created: bool,
}

/// Per-domain slot. Its lock serializes start and stop of that domain; `None`
/// means nothing runs there.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<ForwardingSession>>>>;

pub struct TunnelController {
    api: Arc<dyn ControlPlane>,
    transport: Arc<dyn RelayTransport>,
    opts: ControllerOptions,
    sessions: DashMap<String, Slot>,
}

impl std::fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelController")
            .field("client_name", &self.opts.client_name)
            .field("domains", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl TunnelController {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        transport: Arc<dyn RelayTransport>,
        opts: ControllerOptions,
    ) -> Self {
        Self {
            api,
            transport,
            opts,
            sessions: DashMap::new(),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.opts.client_name
    }

    pub fn domain_for(&self, subdomain: &str) -> String {
        qualify_domain(subdomain, &self.opts.admin_domain)
    }

    /// Make sure the relay has a descriptor for `spec` and return the parameters
    /// to connect with. Creates the descriptor only when it is missing.
    pub async fn ensure_registered(
        &self,
        spec: &TunnelSpec,
    ) -> Result<ConnectionParameters, TunnelError> {
        Ok(self.register(spec).await?.params)
    }

    async fn register(&self, spec: &TunnelSpec) -> Result<Registration, TunnelError> {
        let domain = self.domain_for(&spec.subdomain);
        let client_name = self.opts.client_name.as_str();

        let tunnels = self.api.list_tunnels(client_name).await?;
        if let Some(desc) = tunnels.get(&domain) {
            tracing::debug!(domain = %domain, "tunnel: already registered");
            return Ok(Registration {
                params: ConnectionParameters::from_descriptor(desc, spec.local_target())?,
                created: false,
            });
        }

        tracing::info!(domain = %domain, client = %client_name, "tunnel: registering");
        self.api
            .create_tunnel(&domain, &spec.to_create_request(client_name))
            .await?;

        // Creation returns no body; key material and port only show up in the list.
        let tunnels = self.api.list_tunnels(client_name).await?;
        let desc = tunnels.get(&domain).ok_or_else(|| {
            TunnelError::RemoteProtocol(format!("tunnel {domain:?} missing after create"))
        })?;
        Ok(Registration {
            params: ConnectionParameters::from_descriptor(desc, spec.local_target())?,
            created: true,
        })
    }

    fn slot(&self, domain: &str) -> Slot {
        self.sessions.entry(domain.to_string()).or_default().clone()
    }

    /// Register if needed and start forwarding. Starting a domain that already runs
    /// returns the running tunnel; a concurrent start of the same domain waits for
    /// the first one and then does the same.
    pub async fn start(&self, spec: &TunnelSpec) -> Result<RunningTunnel, TunnelError> {
        let domain = self.domain_for(&spec.subdomain);
        let slot = self.slot(&domain);
        let mut current = slot.lock().await;
        if let Some(existing) = current.as_ref() {
            tracing::debug!(domain = %domain, "tunnel: already running");
            return Ok(snapshot(&domain, existing).await);
        }

        let reg = self.register(spec).await?;
        let session = Arc::new(ForwardingSession::new(
            reg.params,
            self.transport.clone(),
            self.opts.session.clone(),
        ));

        if let Err(err) = session.start().await {
            tracing::warn!(domain = %domain, err = %err, "tunnel: start failed");
            if reg.created {
                if let Err(del) = self.api.delete_tunnel(&domain).await {
                    tracing::warn!(domain = %domain, err = %del, "tunnel: cleanup delete failed");
                }
            }
            return Err(err);
        }

        *current = Some(session.clone());
        Ok(snapshot(&domain, &session).await)
    }

    /// Stop forwarding `domain` and delete its descriptor on the relay. The delete
    /// is attempted even when the local stop fails. Waits for a start of the same
    /// domain that is still in progress.
    pub async fn stop(&self, domain: &str) -> Result<(), TunnelError> {
        let domain = self.domain_for(domain);
        let Some(slot) = self.sessions.get(&domain).map(|e| e.value().clone()) else {
            return Err(TunnelError::NotRunning(domain));
        };
        let Some(session) = slot.lock().await.take() else {
            return Err(TunnelError::NotRunning(domain));
        };

        let local = session.stop().await;
        if let Err(err) = &local {
            tracing::warn!(domain = %domain, err = %err, "tunnel: local stop failed");
        }
        let remote = self.api.delete_tunnel(&domain).await;
        if let Err(err) = &remote {
            tracing::warn!(domain = %domain, err = %err, "tunnel: descriptor delete failed");
        }

        let res = TunnelError::teardown(local, remote);
        if res.is_ok() {
            tracing::info!(domain = %domain, "tunnel: stopped");
        }
        res
    }

    /// Stop every running tunnel. Returns the failures; empty means clean.
    pub async fn stop_all(&self) -> Vec<(String, TunnelError)> {
        let mut domains: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        domains.sort();

        let mut failed = Vec::new();
        for domain in domains {
            match self.stop(&domain).await {
                Ok(()) | Err(TunnelError::NotRunning(_)) => {}
                Err(err) => failed.push((domain, err)),
            }
        }
        failed
    }

    /// Tunnels that are up. A domain in the middle of starting or stopping is left
    /// out.
    pub async fn running(&self) -> Vec<RunningTunnel> {
        let slots: Vec<(String, Slot)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut out = Vec::with_capacity(slots.len());
        for (domain, slot) in slots {
            let session = match slot.try_lock() {
                Ok(current) => current.clone(),
                Err(_) => continue,
            };
            if let Some(s) = session {
                out.push(snapshot(&domain, &s).await);
            }
        }
        out.sort_by(|a, b| a.domain.cmp(&b.domain));
        out
    }
}

async fn snapshot(domain: &str, s: &ForwardingSession) -> RunningTunnel {
    RunningTunnel {
        domain: domain.to_string(),
        remote_port: s.remote_port().await,
        local: s.params().local.to_string(),
        state: s.state(),
        live: s.is_live(),
        stats: s.stats(),
    }
}
