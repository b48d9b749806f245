//! Client for a boringproxy-style relay: registers tunnels over its REST API and
//! forwards the SSH `forwarded-tcpip` channels it opens to local TCP services.

pub mod api;
pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod tunnel;

pub use app::{Command, run};
pub use error::TunnelError;
