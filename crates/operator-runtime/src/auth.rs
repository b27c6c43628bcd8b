//! Cluster credentials for the write path.
//!
//! The watch path uses a `kube::Client`; status and finalizer writes go through
//! plain `reqwest`. Both are built from the one [`kube::Config`] returned by
//! [`cluster_config`], so writes always reach the cluster the watches read from,
//! with the same identity.
//!
//! Supported user material: bearer token (inline or `tokenFile`), basic auth,
//! client certificate and key, and impersonation. Exec and auth-provider
//! plugins are rejected with [`OperatorError::Auth`].

use crate::error::OperatorError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Certificate, Client, Identity, Proxy, RequestBuilder};
use secrecy::ExposeSecret;
use std::path::Path;
use std::time::Duration;
use std::{fmt, fs};
use tracing::{debug, info};

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";

/// Resolves the cluster configuration shared by watches and writes.
///
/// An explicit kubeconfig path wins. Otherwise kube's inference applies:
/// `KUBECONFIG` or `~/.kube/config` first, then the in-cluster service account.
pub async fn cluster_config(kubeconfig: Option<&Path>) -> Result<kube::Config, OperatorError> {
    match kubeconfig {
        Some(path) => {
            debug!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| OperatorError::Auth(format!("{}: {}", path.display(), e)))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| OperatorError::Auth(format!("{}: {}", path.display(), e)))
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| OperatorError::Auth(e.to_string())),
    }
}

/// Per-request credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No header (mTLS only, or an unauthenticated proxy)
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authorization: Basic ...`
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::Bearer(_) => write!(f, "Bearer([REDACTED])"),
            Credentials::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, password: [REDACTED] }}")
            }
        }
    }
}

/// Authentication material of the active cluster configuration.
#[derive(Clone)]
pub struct AuthBridge {
    server: String,
    credentials: Credentials,
    root_certs_der: Vec<Vec<u8>>,
    identity_pem: Option<Vec<u8>>,
    accept_invalid_certs: bool,
    proxy_url: Option<String>,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl fmt::Debug for AuthBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthBridge")
            .field("server", &self.server)
            .field("credentials", &self.credentials)
            .field("root_certs", &self.root_certs_der.len())
            .field("client_identity", &self.identity_pem.is_some())
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("proxy_url", &self.proxy_url)
            .field("headers", &self.headers.len())
            .finish()
    }
}

impl AuthBridge {
    /// Creates a bridge for `server` with the given credentials and no TLS material.
    pub fn new(server: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            credentials,
            root_certs_der: Vec::new(),
            identity_pem: None,
            accept_invalid_certs: false,
            proxy_url: None,
            headers: Vec::new(),
        }
    }

    /// Takes server, CA, proxy and user credentials from a resolved kube config.
    ///
    /// Fails for users authenticated by an exec or auth-provider plugin.
    pub fn from_kube_config(config: &kube::Config) -> Result<Self, OperatorError> {
        let user = &config.auth_info;
        if user.exec.is_some() {
            return Err(OperatorError::Auth(
                "exec credential plugins are not supported for writes".to_string(),
            ));
        }
        if let Some(provider) = &user.auth_provider {
            return Err(OperatorError::Auth(format!(
                "auth-provider {} is not supported for writes",
                provider.name
            )));
        }

        let mut bridge = Self::new(config.cluster_url.to_string(), credentials(user)?)
            .accept_invalid_certs(config.accept_invalid_certs);
        bridge.root_certs_der = config.root_cert.clone().unwrap_or_default();
        bridge.proxy_url = config.proxy_url.as_ref().map(ToString::to_string);
        bridge.headers = config.headers.clone();

        if let Some(name) = &user.impersonate {
            bridge
                .headers
                .push((HeaderName::from_static(IMPERSONATE_USER), header_value(name)?));
        }
        for group in user.impersonate_groups.iter().flatten() {
            bridge
                .headers
                .push((HeaderName::from_static(IMPERSONATE_GROUP), header_value(group)?));
        }

        let cert = data_or_file(user.client_certificate_data.as_deref(), user.client_certificate.as_deref())?;
        let key = data_or_file(
            user.client_key_data.as_ref().map(|k| k.expose_secret()),
            user.client_key.as_deref(),
        )?;
        if let (Some(cert), Some(key)) = (cert, key) {
            bridge = bridge.with_identity(&cert, &key);
        }

        info!("Write path targets {} with {:?}", bridge.server, bridge.credentials);
        Ok(bridge)
    }

    /// Sets the client certificate and key (both PEM) for mTLS.
    #[must_use]
    pub fn with_identity(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Self {
        let mut pem = cert_pem.to_vec();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(key_pem);
        self.identity_pem = Some(pem);
        self
    }

    /// Disables server certificate verification.
    #[must_use]
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// API server base URL, without trailing slash.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Credentials attached to each request.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Client certificate and key PEM, if configured.
    pub fn identity_pem(&self) -> Option<&[u8]> {
        self.identity_pem.as_deref()
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    /// Attaches the credentials and extra headers to a request.
    pub fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = self
            .headers
            .iter()
            .fold(builder, |b, (name, value)| b.header(name.clone(), value.clone()));
        match &self.credentials {
            Credentials::None => builder,
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }

    /// Builds an HTTP client trusting the cluster CA and presenting the client
    /// identity, if any.
    pub fn build_client(&self, timeout: Duration) -> Result<Client, OperatorError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs);
        for der in &self.root_certs_der {
            builder = builder.add_root_certificate(Certificate::from_der(der)?);
        }
        if let Some(pem) = &self.identity_pem {
            builder = builder.identity(Identity::from_pem(pem)?);
        }
        builder = match &self.proxy_url {
            Some(url) => builder.proxy(Proxy::all(url.as_str())?),
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }
}

fn credentials(user: &AuthInfo) -> Result<Credentials, OperatorError> {
    if let Some(token) = &user.token {
        return Ok(Credentials::Bearer(token.expose_secret().to_string()));
    }
    // In-cluster configs point here for the service account token. Read once.
    if let Some(file) = &user.token_file {
        let token = fs::read_to_string(file)?;
        return Ok(Credentials::Bearer(token.trim().to_string()));
    }
    match (&user.username, &user.password) {
        (Some(username), Some(password)) => Ok(Credentials::Basic {
            username: username.clone(),
            password: password.expose_secret().to_string(),
        }),
        _ => Ok(Credentials::None),
    }
}

fn data_or_file(data: Option<&str>, file: Option<&str>) -> Result<Option<Vec<u8>>, OperatorError> {
    if let Some(data) = data {
        let decoded = STANDARD
            .decode(data.trim())
            .map_err(|e| OperatorError::Auth(format!("invalid base64 in kubeconfig: {e}")))?;
        return Ok(Some(decoded));
    }
    match file {
        Some(file) => Ok(Some(fs::read(file)?)),
        None => Ok(None),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, OperatorError> {
    HeaderValue::from_str(value)
        .map_err(|e| OperatorError::Auth(format!("invalid impersonation value {value:?}: {e}")))
}
