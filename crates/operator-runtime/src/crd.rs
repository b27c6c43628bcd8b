//! CustomResourceDefinition registration

use crate::auth::AuthBridge;
use crate::error::OperatorError;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use reqwest::header::ACCEPT;
use reqwest::{Client, Request, StatusCode};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Collection endpoint for CRDs.
pub const CRD_PATH: &str = "/apis/apiextensions.k8s.io/v1/customresourcedefinitions";

/// What a registered CRD serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdRegistration {
    /// API group
    pub group: String,
    /// Served version names, in manifest order
    pub versions: Vec<String>,
    /// Plural resource name
    pub plural: String,
}

impl From<&CustomResourceDefinition> for CrdRegistration {
    fn from(crd: &CustomResourceDefinition) -> Self {
        Self {
            group: crd.spec.group.clone(),
            versions: crd.spec.versions.iter().map(|v| v.name.clone()).collect(),
            plural: crd.spec.names.plural.clone(),
        }
    }
}

/// Parses a CRD from a YAML (or JSON) manifest.
pub fn load_manifest(path: &Path) -> Result<CustomResourceDefinition, OperatorError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Creates CRDs on the API server.
#[derive(Debug, Clone)]
pub struct CrdRegistrar {
    auth: Arc<AuthBridge>,
    client: Client,
}

impl CrdRegistrar {
    /// Creates a registrar sending through `client`.
    pub fn new(auth: Arc<AuthBridge>, client: Client) -> Self {
        Self { auth, client }
    }

    /// Builds the creation request for `crd`.
    pub fn request(&self, crd: &CustomResourceDefinition) -> Result<Request, OperatorError> {
        Ok(self
            .auth
            .apply(self.client.post(self.auth.url(CRD_PATH)))
            .header(ACCEPT, "application/json")
            .json(crd)
            .build()?)
    }

    /// Creates `crd`. An already existing CRD counts as registered.
    pub async fn register(&self, crd: &CustomResourceDefinition) -> Result<CrdRegistration, OperatorError> {
        let name = crd.metadata.name.clone().unwrap_or_default();
        let registration = CrdRegistration::from(crd);
        debug!("Registering CRD {}", name);

        let response = self.client.execute(self.request(crd)?).await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            info!("CRD {} already exists", name);
            return Ok(registration);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::Crd {
                name,
                reason: format!("{} - {}", status, body),
            });
        }

        info!(
            "Registered CRD {} ({} {:?})",
            name, registration.group, registration.versions
        );
        Ok(registration)
    }

    /// Loads a manifest from `path` and registers it.
    pub async fn register_from_file(&self, path: &Path) -> Result<CrdRegistration, OperatorError> {
        let crd = load_manifest(path)?;
        self.register(&crd).await
    }
}
