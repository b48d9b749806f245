//! Client identity on the relay, and the top-level handle that owns it.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    api::{ApiError, ControlPlane},
    error::TunnelError,
    tunnel::TunnelController,
};

/// A registered client name. Must be given back with [`ClientLease::release`].
#[must_use = "a lease must be released explicitly"]
pub struct ClientLease {
    api: Arc<dyn ControlPlane>,
    owner: String,
    name: String,
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ClientLease {
    pub async fn acquire(
        api: Arc<dyn ControlPlane>,
        owner: &str,
        name: &str,
    ) -> Result<Self, ApiError> {
        api.register_client(owner, name).await?;
        tracing::info!(owner = %owner, client = %name, "client: registered");
        Ok(Self {
            api,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(self) -> Result<(), ApiError> {
        self.api.deregister_client(&self.owner, &self.name).await?;
        tracing::info!(owner = %self.owner, client = %self.name, "client: deregistered");
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("shutdown: {} tunnel(s) failed to stop, release: {}", .tunnels.len(), release_summary(.release))]
pub struct ShutdownError {
    pub tunnels: Vec<(String, TunnelError)>,
    pub release: Option<ApiError>,
}

fn release_summary(release: &Option<ApiError>) -> String {
    match release {
        Some(err) => err.to_string(),
        None => "ok".to_string(),
    }
}

/// One client identity plus the tunnels running under it.
#[derive(Debug)]
pub struct Client {
    lease: ClientLease,
    controller: Arc<TunnelController>,
}

impl Client {
    pub fn new(lease: ClientLease, controller: Arc<TunnelController>) -> Self {
        Self { lease, controller }
    }

    pub fn controller(&self) -> &Arc<TunnelController> {
        &self.controller
    }

    pub fn name(&self) -> &str {
        self.lease.name()
    }

    /// Stop every tunnel, then release the client identity. The release runs even
    /// when some tunnels failed to stop.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        let tunnels = self.controller.stop_all().await;
        for (domain, err) in &tunnels {
            tracing::warn!(domain = %domain, err = %err, "client: tunnel teardown failed");
        }
        let release = self.lease.release().await.err();
        if let Some(err) = &release {
            tracing::warn!(err = %err, "client: release failed");
        }
        if tunnels.is_empty() && release.is_none() {
            return Ok(());
        }
        Err(ShutdownError { tunnels, release })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{
        ControllerOptions, TunnelSpec,
        testing::{Call, FakeControlPlane, FakeTransport},
    };

    #[tokio::test]
    async fn shutdown_stops_tunnels_before_deregistering() {
        let api = FakeControlPlane::new();
        let plane: Arc<dyn ControlPlane> = Arc::new(api.clone());
        let lease = ClientLease::acquire(plane.clone(), "admin", "laptop").await.unwrap();
        let controller = Arc::new(TunnelController::new(
            plane,
            FakeTransport::fresh(),
            ControllerOptions {
                client_name: "laptop".into(),
                admin_domain: "bp.example.com".into(),
                ..Default::default()
            },
        ));
        let client = Client::new(lease, controller);
        assert_eq!(client.name(), "laptop");
        client
            .controller()
            .start(&TunnelSpec::new("app", 8080))
            .await
            .unwrap();

        client.shutdown().await.unwrap();

        let calls = api.calls();
        assert_eq!(calls.first(), Some(&Call::Register("admin".into(), "laptop".into())));
        assert_eq!(calls.last(), Some(&Call::Deregister("admin".into(), "laptop".into())));
        let delete = calls
            .iter()
            .position(|c| *c == Call::Delete("app.bp.example.com".into()))
            .unwrap();
        assert_eq!(delete, calls.len() - 2);
    }

    #[tokio::test]
    async fn shutdown_releases_even_when_a_tunnel_leaks() {
        let api = FakeControlPlane::new();
        let plane: Arc<dyn ControlPlane> = Arc::new(api.clone());
        let lease = ClientLease::acquire(plane.clone(), "admin", "laptop").await.unwrap();
        let controller = Arc::new(TunnelController::new(
            plane,
            FakeTransport::fresh(),
            ControllerOptions {
                client_name: "laptop".into(),
                admin_domain: "bp.example.com".into(),
                ..Default::default()
            },
        ));
        controller.start(&TunnelSpec::new("app", 8080)).await.unwrap();
        api.fail_delete_with(500);

        let err = Client::new(lease, controller).shutdown().await.unwrap_err();
        assert_eq!(err.tunnels.len(), 1);
        assert!(err.release.is_none());
        assert_eq!(
            api.calls().last(),
            Some(&Call::Deregister("admin".into(), "laptop".into()))
        );
    }
}
