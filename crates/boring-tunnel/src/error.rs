use thiserror::Error;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The relay rejected the SSH login.
    #[error("relay rejected authentication for user {user:?}")]
    Authentication { user: String },

    /// Reaching the relay failed before authentication completed.
    #[error("relay connect {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The control plane answered, but not with what we needed.
    #[error("control plane: {0}")]
    RemoteProtocol(String),

    #[error(transparent)]
    Remote(#[from] ApiError),

    #[error("dial local target {target}: {source}")]
    LocalDial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while piping an established channel.
    #[error("channel from {origin}: {source}")]
    Channel {
        origin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session already stopped")]
    AlreadyStopped,

    #[error("session already started")]
    AlreadyStarted,

    #[error("relay transport closed")]
    TransportClosed,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("tunnel {0:?} is not running")]
    NotRunning(String),

    /// Stopping finished, but the local side, the remote side, or both failed.
    #[error("teardown: {}", teardown_summary(.local, .remote))]
    Teardown {
        local: Option<Box<TunnelError>>,
        remote: Option<ApiError>,
    },
}

impl TunnelError {
    /// True when the error is the control plane's status-mapped kind.
    pub fn is_remote_state(&self) -> bool {
        matches!(self, TunnelError::Remote(e) if e.is_status())
    }

    /// Combine a local and a remote teardown result into a single outcome.
    pub(crate) fn teardown(
        local: Result<(), TunnelError>,
        remote: Result<(), ApiError>,
    ) -> Result<(), TunnelError> {
        match (local, remote) {
            (Ok(()), Ok(())) => Ok(()),
            (local, remote) => Err(TunnelError::Teardown {
                local: local.err().map(Box::new),
                remote: remote.err(),
            }),
        }
    }
}

fn teardown_summary(local: &Option<Box<TunnelError>>, remote: &Option<ApiError>) -> String {
    match (local, remote) {
        (Some(l), Some(r)) => format!("local: {l}; remote descriptor leaked: {r}"),
        (Some(l), None) => format!("local: {l}"),
        (None, Some(r)) => format!("stopped locally but remote descriptor leaked: {r}"),
        (None, None) => "ok".to_string(),
    }
}
