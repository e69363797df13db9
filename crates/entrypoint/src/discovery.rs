//! Dependency discovery through the Kubernetes Endpoints API.
//!
//! The resolver polls until the named endpoint exposes a subset carrying the
//! requested port. "Not found", "no subsets yet" and "port not present yet"
//! are all retried; anything that goes wrong talking to the API server is
//! fatal for the whole startup.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use tracing::{error, info};

use crate::deps::Dependency;
use crate::error::{EntrypointError, EntrypointResult};
use crate::retry::RetryPolicy;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of a `v1/Endpoints` object we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Endpoints {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointSubset {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointAddress {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("endpoint error: HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("http error: {0}")]
    Transport(String),
}

/// Lookup of a named endpoint. `Ok(None)` means the object does not exist yet.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, DiscoveryError>;
}

/// How a dependency declared without a port name is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortPolicy {
    /// A port matches only when its name equals the declared port name.
    /// A dependency without a port name never matches.
    #[default]
    Strict,
    /// Like `Strict`, but an empty port name matches the first port of the
    /// first subset that has one.
    AnyPort,
}

impl PortPolicy {
    fn matches(self, wanted: &str, port: &EndpointPort) -> bool {
        if wanted.is_empty() {
            return self == Self::AnyPort;
        }
        port.name.as_deref() == Some(wanted)
    }
}

/// Pick hosts and port from the first subset holding a matching port.
/// Subsets without ready addresses are skipped.
pub fn select(
    endpoints: &Endpoints,
    port_name: &str,
    policy: PortPolicy,
) -> Option<(Vec<String>, u16)> {
    endpoints.subsets.iter().find_map(|subset| {
        if subset.addresses.is_empty() {
            return None;
        }
        subset
            .ports
            .iter()
            .find(|port| policy.matches(port_name, port))
            .map(|port| (hosts_from_subset(subset), port.port))
    })
}

/// Hostname when the address carries one, numeric address otherwise.
pub fn hosts_from_subset(subset: &EndpointSubset) -> Vec<String> {
    subset
        .addresses
        .iter()
        .map(|address| match address.hostname.as_deref() {
            Some(hostname) if !hostname.is_empty() => hostname.to_string(),
            _ => address.ip.clone(),
        })
        .collect()
}

/// Poll `discovery` until `dep` resolves, filling in its hosts and port.
pub async fn resolve(
    discovery: &dyn Discovery,
    namespace: &str,
    dep: &mut Dependency,
    policy: PortPolicy,
    retry: &RetryPolicy,
) -> EntrypointResult<()> {
    let what = format!("endpoint '{}'", dep.name);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        info!(
            dependency = %dep.name,
            namespace,
            port_name = %dep.port_name,
            attempt,
            "looking for endpoint"
        );

        let endpoints = match discovery.endpoints(namespace, &dep.name).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(dependency = %dep.name, namespace, error = %e, "endpoint lookup failed");
                return Err(EntrypointError::Discovery {
                    dependency: dep.name.clone(),
                    detail: e.to_string(),
                });
            }
        };

        match endpoints {
            None => info!(dependency = %dep.name, "endpoint not found"),
            Some(endpoints) if endpoints.subsets.iter().all(|s| s.addresses.is_empty()) => {
                info!(dependency = %dep.name, "endpoint has no ready addresses");
            }
            Some(endpoints) => match select(&endpoints, &dep.port_name, policy) {
                Some((hosts, port)) => {
                    info!(dependency = %dep.name, hosts = ?hosts, port, "endpoint found");
                    dep.hosts = hosts;
                    dep.port = Some(port);
                    return Ok(());
                }
                None => info!(
                    dependency = %dep.name,
                    port_name = %dep.port_name,
                    "port not found on endpoint"
                ),
            },
        }

        retry.backoff(attempt, &what).await?;
    }
}

/// Namespace of this pod, from the service-account mount.
pub async fn read_namespace(path: &Path) -> EntrypointResult<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EntrypointError::local_io("read namespace", path, e))?;
    let namespace = raw.trim();
    if namespace.is_empty() {
        return Err(EntrypointError::Config(format!(
            "namespace file '{}' is empty",
            path.display()
        )));
    }
    Ok(namespace.to_string())
}

/// Kubernetes API client authenticated with the pod's service account.
pub struct KubeClient {
    client: Client,
    api_url: String,
    token: String,
}

impl KubeClient {
    pub fn new(api_url: String, token: String, ca_pem: Option<&[u8]>) -> EntrypointResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| EntrypointError::Config(format!("cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| EntrypointError::Config(format!("http client: {e}")))?;

        info!(api_url = %api_url, "kubernetes client initialized");

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build a client from the mounted service-account token and CA bundle.
    /// The CA bundle is optional so plain-HTTP API proxies keep working.
    pub async fn from_service_account(
        api_url: String,
        token_file: &Path,
        ca_file: &Path,
    ) -> EntrypointResult<Self> {
        let token = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|e| EntrypointError::local_io("read token", token_file, e))?;

        let ca_pem = match tokio::fs::read(ca_file).await {
            Ok(pem) => Some(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(EntrypointError::local_io("read CA", ca_file, e)),
        };

        Self::new(api_url, token.trim().to_string(), ca_pem.as_deref())
    }
}

#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl Discovery for KubeClient {
    async fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, DiscoveryError> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/endpoints/{name}",
            self.api_url
        );
        let mut req = self.client.get(url);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = resp
                .json::<StatusBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_default();
            return Err(DiscoveryError::Status {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<Endpoints>()
            .await
            .map(Some)
            .map_err(|e| DiscoveryError::Transport(e.to_string()))
    }
}
