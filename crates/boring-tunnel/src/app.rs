use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;

use crate::{
    api::{ApiReply, ControlPlane, WebApi, WebApiOptions},
    client::{Client, ClientLease},
    config::{self, Config},
    logging,
    tunnel::{
        ControllerOptions, TunnelController, TunnelSpec,
        session::SessionOptions,
        transport::ssh::{SshTransport, SshTransportOptions},
    },
};

/// What the binary was asked to do.
#[derive(Debug, Clone)]
pub enum Command {
    /// Serve every tunnel in the config file.
    Run,
    /// Serve a single tunnel.
    Start {
        subdomain: String,
        addr: Option<String>,
        port: Option<u16>,
    },
    /// Delete a tunnel descriptor on the relay.
    Stop { subdomain: String },
    List,
    AddUser { username: String, admin: bool },
    DeleteUser { username: String },
    AddToken { owner: String },
    DeleteToken { token: String },
}

pub async fn run(config_path: Option<PathBuf>, command: Command) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::debug!(
        config = %resolved.path.display(),
        source = %resolved.source,
        admin_domain = %cfg.api.admin_domain,
        client = %cfg.api.client_name,
        "boring-tunnel: config loaded"
    );

    let api = Arc::new(
        WebApi::new(WebApiOptions {
            admin_domain: cfg.api.admin_domain.clone(),
            user: cfg.api.user.clone(),
            token: cfg.api.token.clone(),
            request_timeout: Duration::from_secs(30),
            base_url: None,
        })
        .context("api: init client")?,
    );

    match command {
        Command::Run => {
            if cfg.tunnels.is_empty() {
                anyhow::bail!("config: nothing to run (add at least one [[tunnels]] entry)");
            }
            let specs = cfg.tunnels.clone();
            serve(&cfg, api, specs).await
        }
        Command::Start {
            subdomain,
            addr,
            port,
        } => {
            let spec = single_spec(&cfg, &subdomain, addr, port);
            serve(&cfg, api, vec![spec]).await
        }
        Command::Stop { subdomain } => {
            api.delete_tunnel(&subdomain)
                .await
                .with_context(|| format!("delete tunnel {subdomain}"))?;
            tracing::info!(subdomain = %subdomain, "tunnel: descriptor deleted");
            Ok(())
        }
        Command::List => {
            let mut tunnels = api
                .list_tunnels(&cfg.api.client_name)
                .await
                .context("list tunnels")?;
            for t in tunnels.values_mut() {
                t.tunnel_private_key.clear();
                t.auth_password.clear();
            }
            println!("{}", serde_json::to_string_pretty(&tunnels)?);
            Ok(())
        }
        Command::AddUser { username, admin } => {
            api.add_user(&username, admin)
                .await
                .with_context(|| format!("add user {username}"))?;
            Ok(())
        }
        Command::DeleteUser { username } => {
            api.delete_user(&username)
                .await
                .with_context(|| format!("delete user {username}"))?;
            Ok(())
        }
        Command::AddToken { owner } => {
            let reply = api
                .add_token(&owner)
                .await
                .with_context(|| format!("add token for {owner}"))?;
            match reply {
                ApiReply::Json(v) => println!("{}", serde_json::to_string_pretty(&v)?),
                ApiReply::Text(t) => println!("{}", t.trim()),
                ApiReply::Redirect => {}
            }
            Ok(())
        }
        Command::DeleteToken { token } => {
            api.delete_token(&token).await.context("delete token")?;
            Ok(())
        }
    }
}

/// The configured tunnel named `subdomain`, or a fresh one, with CLI overrides.
fn single_spec(
    cfg: &Config,
    subdomain: &str,
    addr: Option<String>,
    port: Option<u16>,
) -> TunnelSpec {
    let mut spec = cfg
        .tunnels
        .iter()
        .find(|t| t.subdomain == subdomain.trim())
        .cloned()
        .unwrap_or_else(|| TunnelSpec::new(subdomain.trim(), 5555));
    if let Some(addr) = addr.filter(|a| !a.trim().is_empty()) {
        spec.client_addr = addr.trim().to_string();
    }
    if let Some(port) = port.filter(|p| *p != 0) {
        spec.client_port = port;
    }
    spec
}

fn controller_options(cfg: &Config) -> ControllerOptions {
    ControllerOptions {
        client_name: cfg.api.client_name.clone(),
        admin_domain: cfg.api.admin_domain.clone(),
        session: SessionOptions {
            poll_interval: cfg.session.poll_interval,
            dial_timeout: cfg.session.dial_timeout,
            drain_timeout: cfg.session.drain_timeout,
            remote_bind_address: cfg.session.remote_bind_address.clone(),
        },
    }
}

async fn serve(cfg: &Config, api: Arc<WebApi>, specs: Vec<TunnelSpec>) -> anyhow::Result<()> {
    let plane: Arc<dyn ControlPlane> = api.clone();
    let lease = ClientLease::acquire(plane.clone(), api.user(), &cfg.api.client_name)
        .await
        .context("register client")?;

    let transport = Arc::new(SshTransport::new(SshTransportOptions {
        connect_timeout: cfg.session.connect_timeout,
        strict_host_key: cfg.session.strict_host_key,
        ..Default::default()
    }));
    let controller = Arc::new(TunnelController::new(
        plane,
        transport,
        controller_options(cfg),
    ));
    let client = Client::new(lease, controller.clone());

    let outcome = run_until_stopped(&controller, &specs, cfg.session.poll_interval).await;

    // Teardown runs on every path, including a failed start.
    let teardown = client.shutdown().await;
    match (outcome, teardown) {
        (Ok(()), Ok(())) => {
            tracing::info!("boring-tunnel: stopped");
            Ok(())
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(err)) => Err(err.into()),
        (Err(err), Err(teardown)) => {
            tracing::error!(err = %teardown, "shutdown: teardown failed");
            Err(err)
        }
    }
}

async fn run_until_stopped(
    controller: &TunnelController,
    specs: &[TunnelSpec],
    poll: Duration,
) -> anyhow::Result<()> {
    for spec in specs {
        let t = controller
            .start(spec)
            .await
            .with_context(|| format!("start tunnel {}", spec.subdomain))?;
        tracing::info!(
            domain = %t.domain,
            remote_port = ?t.remote_port,
            local = %t.local,
            "boring-tunnel: tunnel up"
        );
    }

    let mut tick = tokio::time::interval(poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or a lost relay connection.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown: signal");
                return Ok(());
            }
            _ = tick.tick() => {
                let lost: Vec<String> = controller
                    .running()
                    .await
                    .into_iter()
                    .filter(|t| !t.live)
                    .map(|t| t.domain)
                    .collect();
                if !lost.is_empty() {
                    anyhow::bail!("relay connection lost: {}", lost.join(", "));
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
