//! In-memory relay and control plane used by the tunnel tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{io::DuplexStream, sync::mpsc};

use crate::{
    api::{ApiError, ControlPlane, CreateTunnel, TunnelDescriptor},
    error::TunnelError,
    tunnel::{
        params::{self, ConnectionParameters, LocalTarget},
        transport::{IncomingChannel, RelaySession, RelayTransport},
    },
};

pub(crate) fn params_for(remote_port: u32, local_port: u16) -> ConnectionParameters {
    ConnectionParameters::from_descriptor(
        &params::tests::descriptor("app.example.com", remote_port),
        LocalTarget::new("127.0.0.1", local_port),
    )
    .unwrap()
}

struct RelayState {
    forwards: Vec<(String, u32)>,
    cancelled: Vec<(String, u32)>,
    forwarding: bool,
}

/// Relay side of a fake SSH connection. Tests open channels through it.
#[derive(Clone)]
pub(crate) struct FakeRelay {
    tx: Arc<Mutex<Option<mpsc::Sender<IncomingChannel>>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IncomingChannel>>>,
    state: Arc<Mutex<RelayState>>,
    closed: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
    assigned_port: Option<u32>,
}

impl FakeRelay {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            state: Arc::new(Mutex::new(RelayState {
                forwards: Vec::new(),
                cancelled: Vec::new(),
                forwarding: false,
            })),
            closed: Arc::new(AtomicBool::new(false)),
            close_calls: Arc::new(AtomicUsize::new(0)),
            assigned_port: None,
        }
    }

    pub(crate) fn with_assigned_port(mut self, port: u32) -> Self {
        self.assigned_port = Some(port);
        self
    }

    /// Open a forwarded channel and return the public end of it. Panics if the
    /// relay refuses.
    pub(crate) async fn open_channel(&self, origin: &str) -> DuplexStream {
        self.try_open_channel(origin)
            .await
            .expect("relay refused channel")
    }

    /// Open a forwarded channel unless the forward is cancelled or the connection is
    /// gone.
    pub(crate) async fn try_open_channel(&self, origin: &str) -> Option<DuplexStream> {
        if !self.state.lock().unwrap().forwarding || self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let tx = self.tx.lock().unwrap().clone()?;
        let (public, inner) = tokio::io::duplex(4096);
        tx.send(IncomingChannel {
            stream: Box::new(inner),
            connected: "127.0.0.1:40001".into(),
            origin: origin.to_string(),
        })
        .await
        .ok()?;
        Some(public)
    }

    /// Simulate the relay connection dying.
    pub(crate) fn drop_connection(&self) {
        self.tx.lock().unwrap().take();
    }

    pub(crate) fn forward_requests(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().forwards.clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelaySession for FakeRelay {
    async fn request_forward(&self, bind_addr: &str, port: u32) -> Result<u32, TunnelError> {
        let mut st = self.state.lock().unwrap();
        st.forwards.push((bind_addr.to_string(), port));
        st.forwarding = true;
        Ok(self.assigned_port.unwrap_or(port))
    }

    async fn cancel_forward(&self, bind_addr: &str, port: u32) -> Result<(), TunnelError> {
        let mut st = self.state.lock().unwrap();
        st.cancelled.push((bind_addr.to_string(), port));
        st.forwarding = false;
        Ok(())
    }

    async fn accept_channel(&self) -> Result<IncomingChannel, TunnelError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TunnelError::TransportClosed)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) enum FakeTransport {
    Ok(FakeRelay),
    /// A new relay connection per `connect`.
    Fresh,
    AuthFails,
    Unreachable,
}

impl FakeTransport {
    pub(crate) fn ok(relay: FakeRelay) -> Arc<dyn RelayTransport> {
        Arc::new(FakeTransport::Ok(relay))
    }

    pub(crate) fn fresh() -> Arc<dyn RelayTransport> {
        Arc::new(FakeTransport::Fresh)
    }

    pub(crate) fn auth_fails() -> Arc<dyn RelayTransport> {
        Arc::new(FakeTransport::AuthFails)
    }

    pub(crate) fn unreachable() -> Arc<dyn RelayTransport> {
        Arc::new(FakeTransport::Unreachable)
    }
}

#[async_trait]
impl RelayTransport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn RelaySession>, TunnelError> {
        match self {
            FakeTransport::Ok(relay) => Ok(Arc::new(relay.clone())),
            FakeTransport::Fresh => Ok(Arc::new(FakeRelay::new())),
            FakeTransport::AuthFails => Err(TunnelError::Authentication {
                user: params.relay_username.clone(),
            }),
            FakeTransport::Unreachable => Err(TunnelError::Connect {
                addr: params.relay_addr(),
                reason: "connection refused".into(),
            }),
        }
    }
}

/// Connects after `delay`, with a new relay each time. Keeps every relay it handed
/// out.
pub(crate) struct SlowTransport {
    delay: Duration,
    made: Mutex<Vec<FakeRelay>>,
}

impl SlowTransport {
    pub(crate) fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            made: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn relays(&self) -> Vec<FakeRelay> {
        self.made.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for SlowTransport {
    fn name(&self) -> &'static str {
        "fake-slow"
    }

    async fn connect(
        &self,
        _params: &ConnectionParameters,
    ) -> Result<Arc<dyn RelaySession>, TunnelError> {
        tokio::time::sleep(self.delay).await;
        let relay = FakeRelay::new();
        self.made.lock().unwrap().push(relay.clone());
        Ok(Arc::new(relay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    List(String),
    Create(String),
    Delete(String),
    Register(String, String),
    Deregister(String, String),
}

#[derive(Default)]
struct PlaneState {
    tunnels: BTreeMap<String, TunnelDescriptor>,
    calls: Vec<Call>,
    next_port: u32,
}

/// Control plane that keeps tunnels in memory and records every call.
#[derive(Clone, Default)]
pub(crate) struct FakeControlPlane {
    state: Arc<Mutex<PlaneState>>,
    fail_create: Arc<Mutex<Option<u16>>>,
    fail_delete: Arc<Mutex<Option<u16>>>,
    hide_created: Arc<AtomicBool>,
}

fn status_error(status: u16) -> ApiError {
    crate::api::classify_response(status, format!("status {status}"))
        .expect_err("status must map to an error")
}

impl FakeControlPlane {
    pub(crate) fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().next_port = 40001;
        fake
    }

    pub(crate) fn with_tunnel(self, domain: &str, port: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .insert(domain.to_string(), params::tests::descriptor(domain, port));
        self
    }

    pub(crate) fn fail_create_with(&self, status: u16) {
        *self.fail_create.lock().unwrap() = Some(status);
    }

    pub(crate) fn fail_delete_with(&self, status: u16) {
        *self.fail_delete.lock().unwrap() = Some(status);
    }

    /// Accept creates but never list the result.
    pub(crate) fn hide_created(&self) {
        self.hide_created.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn has_tunnel(&self, domain: &str) -> bool {
        self.state.lock().unwrap().tunnels.contains_key(domain)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_tunnels(
        &self,
        client_name: &str,
    ) -> Result<BTreeMap<String, TunnelDescriptor>, ApiError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::List(client_name.to_string()));
        Ok(st.tunnels.clone())
    }

    async fn create_tunnel(&self, domain: &str, req: &CreateTunnel) -> Result<(), ApiError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::Create(domain.to_string()));
        if let Some(status) = *self.fail_create.lock().unwrap() {
            return Err(status_error(status));
        }
        if self.hide_created.load(Ordering::SeqCst) {
            return Ok(());
        }
        let port = st.next_port;
        st.next_port += 1;
        let mut d = params::tests::descriptor(domain, port);
        d.client_name = req.client_name.clone();
        d.client_port = req.client_port;
        st.tunnels.insert(domain.to_string(), d);
        Ok(())
    }

    async fn delete_tunnel(&self, domain: &str) -> Result<(), ApiError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::Delete(domain.to_string()));
        if let Some(status) = *self.fail_delete.lock().unwrap() {
            return Err(status_error(status));
        }
        st.tunnels.remove(domain);
        Ok(())
    }

    async fn register_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError> {
        let mut st = self.state.lock().unwrap();
        st.calls
            .push(Call::Register(owner.to_string(), client_name.to_string()));
        Ok(())
    }

    async fn deregister_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError> {
        let mut st = self.state.lock().unwrap();
        st.calls
            .push(Call::Deregister(owner.to_string(), client_name.to_string()));
        Ok(())
    }
}
