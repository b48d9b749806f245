//! Forwarding session: one relay connection, one remote port, one accept loop.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    error::TunnelError,
    tunnel::{
        handler::ChannelHandler,
        params::{ConnectionParameters, LocalTarget},
        transport::{RelaySession, RelayTransport},
    },
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on how long the accept loop waits before re-checking liveness.
    pub poll_interval: Duration,
    pub dial_timeout: Duration,
    /// Close the transport this long after `stop` even if channels are still
    /// draining. `None` waits for every channel.
    pub drain_timeout: Option<Duration>,
    pub remote_bind_address: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            dial_timeout: Duration::from_secs(5),
            drain_timeout: None,
            remote_bind_address: "127.0.0.1".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unstarted,
    Connecting,
    Listening,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unstarted => write!(f, "unstarted"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Listening => write!(f, "listening"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionStats {
    pub accepted: u64,
    pub active: usize,
    pub completed: u64,
    pub dial_failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveChannel {
    pub id: u64,
    pub origin: String,
    #[serde(skip)]
    pub started: Instant,
}

/// Accounting for in-flight channel handlers. Handlers own themselves; this only
/// knows they exist.
#[derive(Debug)]
struct Tracker {
    next_id: AtomicU64,
    active: DashMap<u64, ActiveChannel>,
    active_count: watch::Sender<usize>,
    accepted: AtomicU64,
    completed: AtomicU64,
    dial_failures: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Tracker {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            active_count: tx,
            accepted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    fn enter(self: &Arc<Self>, origin: &str) -> HandlerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveChannel {
                id,
                origin: origin.to_string(),
                started: Instant::now(),
            },
        );
        self.active_count.send_modify(|n| *n += 1);
        HandlerGuard {
            tracker: self.clone(),
            id,
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.active_count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: *self.active_count.borrow(),
            completed: self.completed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

struct HandlerGuard {
    tracker: Arc<Tracker>,
    id: u64,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.tracker.active.remove(&self.id);
        self.tracker.completed.fetch_add(1, Ordering::Relaxed);
        self.tracker.active_count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Running {
    relay: Arc<dyn RelaySession>,
    accept: JoinHandle<Result<(), TunnelError>>,
    bound_port: u32,
}

pub struct ForwardingSession {
    params: ConnectionParameters,
    opts: SessionOptions,
    transport: Arc<dyn RelayTransport>,
    state: Mutex<SessionState>,
    live: Arc<AtomicBool>,
    running: tokio::sync::Mutex<Option<Running>>,
    relay: Mutex<Option<Arc<dyn RelaySession>>>,
    tracker: Arc<Tracker>,
}

impl std::fmt::Debug for ForwardingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingSession")
            .field("relay", &self.params.relay_addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ForwardingSession {
    pub fn new(
        params: ConnectionParameters,
        transport: Arc<dyn RelayTransport>,
        mut opts: SessionOptions,
    ) -> Self {
        if opts.poll_interval.is_zero() {
            opts.poll_interval = Duration::from_millis(1000);
        }
        if opts.remote_bind_address.trim().is_empty() {
            opts.remote_bind_address = "127.0.0.1".into();
        }
        Self {
            params,
            opts,
            transport,
            state: Mutex::new(SessionState::Unstarted),
            live: Arc::new(AtomicBool::new(false)),
            running: tokio::sync::Mutex::new(None),
            relay: Mutex::new(None),
            tracker: Arc::new(Tracker::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }

    /// True while the accept loop is taking channels.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn stats(&self) -> SessionStats {
        self.tracker.snapshot()
    }

    pub fn active_channels(&self) -> Vec<ActiveChannel> {
        let mut out: Vec<_> = self.tracker.active.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Port the relay bound for us, once listening.
    pub async fn remote_port(&self) -> Option<u32> {
        self.running.lock().await.as_ref().map(|r| r.bound_port)
    }

    /// Connect, authenticate, request the remote port and start accepting channels.
    /// Returns the remote port the relay bound.
    pub async fn start(&self) -> Result<u32, TunnelError> {
        let mut running = self.running.lock().await;
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st != SessionState::Unstarted {
                return Err(TunnelError::AlreadyStarted);
            }
            *st = SessionState::Connecting;
        }

        let relay = match self.transport.connect(&self.params).await {
            Ok(r) => r,
            Err(err) => {
                self.set_state(SessionState::Stopped);
                return Err(err);
            }
        };

        let bind = self.opts.remote_bind_address.as_str();
        let bound_port = match relay.request_forward(bind, self.params.remote_port).await {
            Ok(p) => p,
            Err(err) => {
                relay.close().await;
                self.set_state(SessionState::Stopped);
                return Err(err);
            }
        };
        if bound_port != self.params.remote_port {
            tracing::info!(
                requested = self.params.remote_port,
                bound = bound_port,
                "tunnel: relay reassigned remote port"
            );
        }

        self.live.store(true, Ordering::SeqCst);
        *self.relay.lock().unwrap_or_else(|e| e.into_inner()) = Some(relay.clone());

        let accept = tokio::spawn(accept_loop(
            relay.clone(),
            self.live.clone(),
            self.tracker.clone(),
            self.params.local.clone(),
            self.opts.clone(),
        ));

        *running = Some(Running {
            relay,
            accept,
            bound_port,
        });
        self.set_state(SessionState::Listening);

        tracing::info!(
            relay = %self.params.relay_addr(),
            transport = %self.transport.name(),
            remote_port = bound_port,
            local = %self.params.local,
            "tunnel: listening"
        );
        Ok(bound_port)
    }

    /// Stop accepting channels. In-flight channels keep running; the transport is
    /// closed once they are done (or after `drain_timeout`).
    ///
    /// Fails with [`TunnelError::AlreadyStopped`] unless the session is listening,
    /// and with [`TunnelError::TransportClosed`] if the relay connection was lost
    /// before this call. A session that is still connecting is not listening:
    /// `stop` returns at once instead of waiting for `start` to finish.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        if self.state() != SessionState::Listening {
            return Err(TunnelError::AlreadyStopped);
        }
        let Some(running) = self.running.lock().await.take() else {
            return Err(TunnelError::AlreadyStopped);
        };
        self.live.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Stopped);

        let Running {
            relay,
            accept,
            bound_port,
        } = running;

        let loop_result = match accept.await {
            Ok(r) => r,
            Err(join_err) => {
                tracing::warn!(err = %join_err, "tunnel: accept loop panicked");
                Err(TunnelError::TransportClosed)
            }
        };

        if loop_result.is_ok() {
            if let Err(err) = relay
                .cancel_forward(&self.opts.remote_bind_address, bound_port)
                .await
            {
                tracing::debug!(err = %err, port = bound_port, "tunnel: cancel forward failed");
            }
        }

        let active = *self.tracker.active_count.borrow();
        tracing::info!(
            relay = %self.params.relay_addr(),
            active,
            "tunnel: stopped accepting"
        );

        let tracker = self.tracker.clone();
        let drain_timeout = self.opts.drain_timeout;
        tokio::spawn(async move {
            match drain_timeout {
                Some(t) => {
                    if tokio::time::timeout(t, tracker.wait_idle()).await.is_err() {
                        tracing::warn!(
                            drain_timeout = %humantime::format_duration(t),
                            "tunnel: drain timed out; closing transport"
                        );
                    }
                }
                None => tracker.wait_idle().await,
            }
            if !relay.is_closed() {
                relay.close().await;
            }
        });

        loop_result
    }

    /// Close the relay connection now. In-flight channels see I/O errors.
    pub async fn close_transport(&self) {
        let relay = self.relay.lock().unwrap_or_else(|e| e.into_inner()).clone();
        self.live.store(false, Ordering::SeqCst);
        match relay {
            Some(relay) if !relay.is_closed() => relay.close().await,
            _ => tracing::debug!(relay = %self.params.relay_addr(), "tunnel: transport already closed"),
        }
    }
}

async fn accept_loop(
    relay: Arc<dyn RelaySession>,
    live: Arc<AtomicBool>,
    tracker: Arc<Tracker>,
    target: LocalTarget,
    opts: SessionOptions,
) -> Result<(), TunnelError> {
    loop {
        if !live.load(Ordering::SeqCst) {
            return Ok(());
        }

        let ch = match tokio::time::timeout(opts.poll_interval, relay.accept_channel()).await {
            Err(_elapsed) => continue,
            Ok(Ok(ch)) => ch,
            Ok(Err(err)) => {
                // Lost the relay while we still wanted channels.
                let was_live = live.swap(false, Ordering::SeqCst);
                if was_live {
                    tracing::warn!(err = %err, "tunnel: relay connection lost");
                    return Err(err);
                }
                return Ok(());
            }
        };

        if !live.load(Ordering::SeqCst) {
            // Raced with stop: the channel is dropped, which closes it.
            tracing::debug!(origin = %ch.origin, "tunnel: rejecting channel after stop");
            return Ok(());
        }

        let guard = tracker.enter(&ch.origin);
        let handler = ChannelHandler::new(ch, target.clone(), opts.dial_timeout);
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let origin = handler.origin().to_string();
            match handler.run().await {
                Ok(stats) => {
                    tracker.bytes_in.fetch_add(stats.a_to_b, Ordering::Relaxed);
                    tracker.bytes_out.fetch_add(stats.b_to_a, Ordering::Relaxed);
                    tracing::debug!(
                        origin = %origin,
                        bytes_in = stats.a_to_b,
                        bytes_out = stats.b_to_a,
                        "tunnel: channel closed"
                    );
                }
                Err(err @ TunnelError::LocalDial { .. }) => {
                    tracker.dial_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(origin = %origin, err = %err, "tunnel: local dial failed");
                }
                Err(err) => {
                    tracing::debug!(origin = %origin, err = %err, "tunnel: channel ended with error");
                }
            }
            drop(guard);
        });
    }
}
