use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, Url, redirect};

use crate::api::{
    ApiError, ApiReply, ControlPlane, CreateTunnel, TunnelDescriptor, classify_response,
    parse_tunnel_map, qualify_domain,
};

#[derive(Debug, Clone)]
pub struct WebApiOptions {
    pub admin_domain: String,
    pub user: String,
    pub token: String,
    pub request_timeout: Duration,
    /// Scheme and authority to send requests to instead of `https://<admin_domain>`.
    pub base_url: Option<String>,
}

/// HTTP client for the relay's admin API (`https://<admin_domain>/api/`).
pub struct WebApi {
    opts: WebApiOptions,
    base: String,
    // Redirects stay unfollowed: a 303 is how the relay reports success.
    http: reqwest::Client,
}

impl std::fmt::Debug for WebApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApi")
            .field("admin_domain", &self.opts.admin_domain)
            .field("user", &self.opts.user)
            .finish_non_exhaustive()
    }
}

/// Where a request goes: the API proper, or a web UI form endpoint that has no API
/// counterpart yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Api,
    WebUi,
}

impl WebApi {
    pub fn new(mut opts: WebApiOptions) -> Result<Self, ApiError> {
        opts.admin_domain = opts.admin_domain.trim().trim_end_matches('/').to_string();
        if opts.admin_domain.is_empty() {
            return Err(ApiError::InvalidArgument("admin_domain is required".into()));
        }
        if opts.user.trim().is_empty() {
            opts.user = "admin".into();
        }
        if opts.request_timeout <= Duration::from_millis(0) {
            opts.request_timeout = Duration::from_secs(30);
        }
        let base = match opts.base_url.as_deref().map(str::trim) {
            Some(b) if !b.is_empty() => b.trim_end_matches('/').to_string(),
            _ => format!("https://{}", opts.admin_domain),
        };

        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self { opts, base, http })
    }

    pub fn admin_domain(&self) -> &str {
        &self.opts.admin_domain
    }

    pub fn user(&self) -> &str {
        &self.opts.user
    }

    fn owner_or_user<'a>(&'a self, owner: &'a str) -> &'a str {
        if owner.trim().is_empty() {
            &self.opts.user
        } else {
            owner.trim()
        }
    }

    fn url(&self, endpoint: Endpoint, path: &str, params: &[(String, String)]) -> Result<Url, ApiError> {
        let base = match endpoint {
            Endpoint::Api => format!("{}/api/{path}", self.base),
            Endpoint::WebUi => format!("{}/{path}", self.base),
        };
        Url::parse_with_params(&base, params.iter())
            .map_err(|e| ApiError::InvalidArgument(format!("url {base}: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        endpoint: Endpoint,
        path: &str,
        params: &[(String, String)],
    ) -> Result<ApiReply, ApiError> {
        if ![Method::GET, Method::POST, Method::PUT, Method::DELETE].contains(&method) {
            return Err(ApiError::MethodNotAllowed(format!("invalid method {method}")));
        }

        let url = self.url(endpoint, path, params)?;

        tracing::debug!(method = %method, path = %path, ?endpoint, "api: request");
        let resp = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, format!("bearer {}", self.opts.token))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;

        let out = classify_response(status, body);
        if let Err(err) = &out {
            tracing::debug!(method = %method, path = %path, status, err = %err, "api: request failed");
        }
        out
    }

    /// Add a user. Admin tokens only.
    pub async fn add_user(&self, username: &str, is_admin: bool) -> Result<(), ApiError> {
        if username.chars().count() < 6 {
            return Err(ApiError::InvalidArgument(
                "username must be at least 6 characters".into(),
            ));
        }
        let params = vec![
            ("username".to_string(), username.to_string()),
            ("is-admin".to_string(), on_off(is_admin)),
        ];
        self.request(Method::POST, Endpoint::Api, "users/", &params)
            .await?;
        Ok(())
    }

    /// Remove a user. Admin tokens only.
    pub async fn delete_user(&self, username: &str) -> Result<(), ApiError> {
        let params = vec![("username".to_string(), username.to_string())];
        self.request(Method::POST, Endpoint::WebUi, "delete-user", &params)
            .await?;
        Ok(())
    }

    /// Issue a new token for `owner` (the API user when empty).
    pub async fn add_token(&self, owner: &str) -> Result<ApiReply, ApiError> {
        let params = vec![("owner".to_string(), self.owner_or_user(owner).to_string())];
        self.request(Method::POST, Endpoint::Api, "tokens/", &params)
            .await
    }

    pub async fn delete_token(&self, token: &str) -> Result<(), ApiError> {
        let params = vec![("token".to_string(), token.to_string())];
        self.request(Method::GET, Endpoint::WebUi, "delete-token", &params)
            .await?;
        Ok(())
    }
}

fn on_off(v: bool) -> String {
    if v { "on".into() } else { "off".into() }
}

fn create_tunnel_params(domain: &str, owner: &str, req: &CreateTunnel) -> Vec<(String, String)> {
    let client_name = if req.client_name.trim().is_empty() {
        "any"
    } else {
        req.client_name.trim()
    };
    let client_addr = if req.client_addr.trim().is_empty() {
        "127.0.0.1"
    } else {
        req.client_addr.trim()
    };
    let tls_termination = if req.tls_termination.trim().is_empty() {
        "server"
    } else {
        req.tls_termination.trim()
    };

    let mut params = vec![
        ("domain".to_string(), domain.to_string()),
        ("owner".to_string(), owner.to_string()),
        ("ssh_key_id".to_string(), req.ssh_key_id.clone()),
        ("client-name".to_string(), client_name.to_string()),
        ("client-addr".to_string(), client_addr.to_string()),
        ("client-port".to_string(), req.client_port.to_string()),
        ("allow-external-tcp".to_string(), on_off(req.allow_external_tcp)),
        ("password-protect".to_string(), on_off(req.password_protect)),
        ("username".to_string(), req.username.clone()),
        ("password".to_string(), req.password.clone()),
        ("tls-termination".to_string(), tls_termination.to_string()),
    ];
    for (k, v) in &req.extra {
        match params.iter_mut().find(|(pk, _)| pk == k) {
            Some(slot) => slot.1 = v.clone(),
            None => params.push((k.clone(), v.clone())),
        }
    }
    params
}

#[async_trait]
impl ControlPlane for WebApi {
    async fn list_tunnels(
        &self,
        client_name: &str,
    ) -> Result<BTreeMap<String, TunnelDescriptor>, ApiError> {
        let mut params = Vec::new();
        if !client_name.trim().is_empty() {
            params.push(("client-name".to_string(), client_name.trim().to_string()));
        }
        let reply = self
            .request(Method::GET, Endpoint::Api, "tunnels", &params)
            .await?;
        parse_tunnel_map(reply)
    }

    async fn create_tunnel(&self, domain: &str, req: &CreateTunnel) -> Result<(), ApiError> {
        let domain = qualify_domain(domain, &self.opts.admin_domain);
        let params = create_tunnel_params(&domain, self.owner_or_user(&req.owner), req);
        self.request(Method::POST, Endpoint::Api, "tunnels", &params)
            .await?;
        Ok(())
    }

    async fn delete_tunnel(&self, domain: &str) -> Result<(), ApiError> {
        let domain = qualify_domain(domain, &self.opts.admin_domain);
        let params = vec![("domain".to_string(), domain)];
        self.request(Method::DELETE, Endpoint::Api, "tunnels", &params)
            .await?;
        Ok(())
    }

    async fn register_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError> {
        let path = format!("users/{}/clients/{}", self.owner_or_user(owner), client_name.trim());
        self.request(Method::PUT, Endpoint::Api, &path, &[]).await?;
        Ok(())
    }

    async fn deregister_client(&self, owner: &str, client_name: &str) -> Result<(), ApiError> {
        let path = format!("users/{}/clients/{}", self.owner_or_user(owner), client_name.trim());
        self.request(Method::DELETE, Endpoint::Api, &path, &[])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    use super::*;

    fn api() -> WebApi {
        WebApi::new(WebApiOptions {
            admin_domain: "bp.example.com/".into(),
            user: "".into(),
            token: "t".into(),
            request_timeout: Duration::from_secs(0),
            base_url: None,
        })
        .unwrap()
    }

    #[test]
    fn new_normalizes_options() {
        let a = api();
        assert_eq!(a.admin_domain(), "bp.example.com");
        assert_eq!(a.user(), "admin");
        assert_eq!(a.opts.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn new_requires_admin_domain() {
        let err = WebApi::new(WebApiOptions {
            admin_domain: " ".into(),
            user: "admin".into(),
            token: String::new(),
            request_timeout: Duration::from_secs(1),
            base_url: None,
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    #[test]
    fn urls_for_api_and_web_ui() {
        let a = api();
        let u = a
            .url(
                Endpoint::Api,
                "tunnels",
                &[("client-name".into(), "my client".into())],
            )
            .unwrap();
        assert_eq!(u.as_str(), "https://bp.example.com/api/tunnels?client-name=my+client");

        let u = a.url(Endpoint::WebUi, "delete-token", &[]).unwrap();
        assert_eq!(u.path(), "/delete-token");
    }

    #[test]
    fn create_params_use_form_defaults_and_extras() {
        let mut req = CreateTunnel {
            client_port: 8080,
            allow_external_tcp: true,
            ..Default::default()
        };
        req.extra.insert("tls-termination".into(), "client".into());
        req.extra.insert("custom".into(), "1".into());

        let params = create_tunnel_params("app.bp.example.com", "admin", &req);
        let get = |k: &str| {
            params
                .iter()
                .find(|(pk, _)| pk == k)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("domain"), "app.bp.example.com");
        assert_eq!(get("client-name"), "any");
        assert_eq!(get("client-addr"), "127.0.0.1");
        assert_eq!(get("client-port"), "8080");
        assert_eq!(get("allow-external-tcp"), "on");
        assert_eq!(get("password-protect"), "off");
        assert_eq!(get("tls-termination"), "client");
        assert_eq!(get("custom"), "1");
    }

    #[tokio::test]
    async fn add_user_rejects_short_names_locally() {
        let err = api().add_user("bob", false).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    /// Minimal relay stand-in. Sends each request head it sees to the returned
    /// receiver. The tunnel list answers 200, `/followed` answers 500, everything
    /// else answers 303 pointing at `/followed`.
    async fn relay_stub() -> (String, mpsc::UnboundedReceiver<String>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", ln.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = ln.accept().await else { return };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match c.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).into_owned();
                    let line = head.lines().next().unwrap_or_default().to_string();
                    let (status, body) = if line.starts_with("GET /api/tunnels") {
                        (
                            "200 OK",
                            r#"{"app.bp.example.com":{"server_address":"bp.example.com","tunnel_port":40001}}"#,
                        )
                    } else if line.contains("/followed") {
                        ("500 Internal Server Error", "followed")
                    } else {
                        ("303 See Other", "")
                    };
                    let _ = tx.send(head);
                    let resp = format!(
                        "HTTP/1.1 {status}\r\nLocation: /followed\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = c.write_all(resp.as_bytes()).await;
                });
            }
        });
        (base, rx)
    }

    #[tokio::test]
    async fn requests_carry_bearer_token_and_take_303_as_success() {
        let (base, mut seen) = relay_stub().await;
        let a = WebApi::new(WebApiOptions {
            admin_domain: "bp.example.com".into(),
            user: "admin".into(),
            token: "s3cret".into(),
            request_timeout: Duration::from_secs(5),
            base_url: Some(format!("{base}/")),
        })
        .unwrap();

        a.delete_tunnel("app").await.unwrap();
        let head = seen.recv().await.unwrap();
        assert!(
            head.starts_with("DELETE /api/tunnels?domain=app.bp.example.com "),
            "{head}"
        );
        assert!(
            head.to_ascii_lowercase().contains("authorization: bearer s3cret"),
            "{head}"
        );

        // Web UI form endpoint: the 303 is the answer, not a hop.
        a.delete_token("tok").await.unwrap();
        let head = seen.recv().await.unwrap();
        assert!(head.starts_with("GET /delete-token?token=tok "), "{head}");

        let tunnels = a.list_tunnels("laptop").await.unwrap();
        assert_eq!(tunnels["app.bp.example.com"].tunnel_port, 40001);
        let head = seen.recv().await.unwrap();
        assert!(head.starts_with("GET /api/tunnels?client-name=laptop "), "{head}");

        assert!(seen.try_recv().is_err(), "a redirect was followed");
    }
}
