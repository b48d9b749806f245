use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunnel::TunnelSpec;

pub const CONFIG_ENV: &str = "BORING_TUNNEL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(explicit_flag_path, std::env::var_os(CONFIG_ENV), Path::new("."))
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    env_path: Option<std::ffi::OsString>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = env_path.filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join("boring-tunnel.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["boring-tunnel.toml", "boring-tunnel.yaml", "boring-tunnel.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("", "", "boring-tunnel")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("boring-tunnel.toml"))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&data)
            .with_context(|| format!("parse yaml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc).with_context(|| format!("config {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub tunnels: Vec<TunnelSpec>,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub admin_domain: String,
    pub user: String,
    pub token: String,
    pub client_name: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("admin_domain", &self.admin_domain)
            .field("user", &self.user)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub dial_timeout: Duration,
    /// `None` waits for every in-flight channel before closing the relay connection.
    pub drain_timeout: Option<Duration>,
    pub remote_bind_address: String,
    pub strict_host_key: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`, lowercased.
    pub format: String,
    pub output: LogOutput,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: LogOutput::Stderr,
            add_source: false,
        }
    }
}

/// Where log lines go. Anything other than the three stream names is a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn from_setting(v: Option<String>) -> Self {
        let v = v.unwrap_or_default();
        match v.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api: FileApi,
    session: Option<FileSession>,
    logging: Option<FileLogging>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileApi {
    admin_domain: String,
    user: Option<String>,
    #[serde(default)]
    token: String,
    client_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSession {
    poll_interval_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    drain_timeout_ms: Option<i64>,
    remote_bind_address: Option<String>,
    strict_host_key: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    subdomain: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    ssh_key_id: String,
    client_addr: Option<String>,
    client_port: Option<u16>,
    #[serde(default)]
    allow_external_tcp: bool,
    #[serde(default)]
    password_protect: bool,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    tls_termination: Option<String>,
    #[serde(default)]
    extra: BTreeMap<String, String>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default),
    }
}

fn non_empty(v: Option<String>, default: &str) -> String {
    match v {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let admin_domain = fc.api.admin_domain.trim().trim_end_matches('/').to_string();
        if admin_domain.is_empty() {
            anyhow::bail!("config: api.admin_domain is required");
        }
        if fc.api.token.trim().is_empty() {
            anyhow::bail!("config: api.token is required");
        }

        let api = ApiConfig {
            admin_domain,
            user: non_empty(fc.api.user, "admin"),
            token: fc.api.token.trim().to_string(),
            client_name: non_empty(fc.api.client_name, "boring-tunnel"),
        };

        let s = fc.session.unwrap_or_default();
        let session = SessionConfig {
            poll_interval: millis(s.poll_interval_ms, 1000),
            connect_timeout: millis(s.connect_timeout_ms, 10_000),
            dial_timeout: millis(s.dial_timeout_ms, 5000),
            drain_timeout: s
                .drain_timeout_ms
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64)),
            remote_bind_address: non_empty(s.remote_bind_address, "127.0.0.1"),
            strict_host_key: s.strict_host_key.unwrap_or(true),
        };

        let logging = match fc.logging {
            Some(l) => {
                let d = LoggingConfig::default();
                LoggingConfig {
                    level: non_empty(l.level, &d.level).to_ascii_lowercase(),
                    format: non_empty(l.format, &d.format).to_ascii_lowercase(),
                    output: LogOutput::from_setting(l.output),
                    add_source: l.add_source,
                }
            }
            None => LoggingConfig::default(),
        };
        if !matches!(logging.format.as_str(), "text" | "json") {
            anyhow::bail!("config: logging.format must be text or json, got {:?}", logging.format);
        }

        let mut tunnels = Vec::with_capacity(fc.tunnels.len());
        for (i, t) in fc.tunnels.into_iter().enumerate() {
            let subdomain = t.subdomain.trim().to_string();
            if subdomain.is_empty() {
                anyhow::bail!("config: tunnels[{i}].subdomain is required");
            }
            if tunnels.iter().any(|x: &TunnelSpec| x.subdomain == subdomain) {
                anyhow::bail!("config: duplicate tunnel {subdomain:?}");
            }
            let mut spec = TunnelSpec::new(subdomain, t.client_port.filter(|p| *p != 0).unwrap_or(5555));
            spec.owner = t.owner.trim().to_string();
            spec.ssh_key_id = t.ssh_key_id.trim().to_string();
            spec.client_addr = non_empty(t.client_addr, "127.0.0.1");
            spec.allow_external_tcp = t.allow_external_tcp;
            spec.password_protect = t.password_protect;
            spec.username = t.username;
            spec.password = t.password;
            spec.tls_termination = non_empty(t.tls_termination, "server");
            spec.extra = t.extra;
            if spec.password_protect && (spec.username.is_empty() || spec.password.is_empty()) {
                anyhow::bail!(
                    "config: tunnel {:?} is password protected but has no username/password",
                    spec.subdomain
                );
            }
            tunnels.push(spec);
        }

        Ok(Config {
            api,
            session,
            logging,
            tunnels,
        })
    }
}
