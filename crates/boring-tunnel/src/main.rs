use clap::{Parser, Subcommand};

use boring_tunnel::Command;

#[derive(Debug, Parser)]
#[command(
    name = "boring-tunnel",
    version,
    about = "boring-tunnel - expose local services through a boringproxy relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses BORING_TUNNEL_CONFIG; then auto-detects boring-tunnel.toml > boring-tunnel.yaml > boring-tunnel.yml from CWD; then falls back to the user config dir.
    #[arg(long, env = "BORING_TUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start every configured tunnel and serve until Ctrl-C / SIGTERM (default).
    Run,
    /// Start one tunnel and serve until Ctrl-C / SIGTERM.
    Start {
        subdomain: String,
        /// Local address to forward to.
        #[arg(long)]
        addr: Option<String>,
        /// Local port to forward to.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete a tunnel on the relay.
    Stop { subdomain: String },
    /// Print this client's tunnels as JSON.
    List,
    /// Manage users (admin token required).
    #[command(subcommand)]
    User(UserCmd),
    /// Manage API tokens.
    #[command(subcommand)]
    Token(TokenCmd),
}

#[derive(Debug, Subcommand)]
enum UserCmd {
    Add {
        username: String,
        #[arg(long)]
        admin: bool,
    },
    Delete { username: String },
}

#[derive(Debug, Subcommand)]
enum TokenCmd {
    Add { owner: String },
    Delete { token: String },
}

impl From<Cmd> for Command {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Run => Command::Run,
            Cmd::Start {
                subdomain,
                addr,
                port,
            } => Command::Start {
                subdomain,
                addr,
                port,
            },
            Cmd::Stop { subdomain } => Command::Stop { subdomain },
            Cmd::List => Command::List,
            Cmd::User(UserCmd::Add { username, admin }) => Command::AddUser { username, admin },
            Cmd::User(UserCmd::Delete { username }) => Command::DeleteUser { username },
            Cmd::Token(TokenCmd::Add { owner }) => Command::AddToken { owner },
            Cmd::Token(TokenCmd::Delete { token }) => Command::DeleteToken { token },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.map(Command::from).unwrap_or(Command::Run);
    boring_tunnel::run(cli.config, command).await
}
