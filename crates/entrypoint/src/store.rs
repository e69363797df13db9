//! Service configuration pulled from etcd and written out as YAML.
//!
//! The value stored under `{prefix}/{dc}/{service}` is a JSON object. It is
//! re-encoded as YAML at `{root}/{service}/config.yaml`. Every failure along
//! the way is retried: the child never starts without its config.

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EntrypointError, EntrypointResult};
use crate::retry::RetryPolicy;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const CONFIG_FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("fetch: {0}")]
    Fetch(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Key/value lookup. `Ok(None)` means the key does not exist yet.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Service and datacenter that select the config key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTarget {
    pub service: String,
    pub datacenter: String,
}

impl ConfigTarget {
    /// Both identifiers must be present, otherwise config fetch is skipped.
    pub fn from_parts(service: Option<&str>, datacenter: Option<&str>) -> Option<Self> {
        let service = service.map(str::trim).filter(|s| !s.is_empty());
        let datacenter = datacenter.map(str::trim).filter(|s| !s.is_empty());
        match (service, datacenter) {
            (Some(service), Some(datacenter)) => Some(Self {
                service: service.to_string(),
                datacenter: datacenter.to_string(),
            }),
            (None, _) => {
                info!("SERVICE_NAME not set; skipping config fetch");
                None
            }
            (Some(_), None) => {
                info!("DC_SHORT_NAME not set; skipping config fetch");
                None
            }
        }
    }

    pub fn key(&self, prefix: &str) -> String {
        format!(
            "{}/{}/{}",
            prefix.trim_end_matches('/'),
            self.datacenter,
            self.service
        )
    }

    pub fn config_file(&self, root: &Path) -> PathBuf {
        root.join(&self.service).join("config.yaml")
    }
}

/// Convert a JSON object into YAML text.
pub fn json_to_yaml(raw: &[u8]) -> Result<String, StoreError> {
    let config: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(raw).map_err(|e| StoreError::Decode(format!("json: {e}")))?;
    serde_yaml_ng::to_string(&config).map_err(|e| StoreError::Decode(format!("yaml: {e}")))
}

/// Replace `path` with `contents` via a temp file in the same directory and a
/// rename, so a reader never sees a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    // Temp files start out 0600; the child may run as another user.
    tmp.as_file()
        .set_permissions(Permissions::from_mode(CONFIG_FILE_MODE))
        .map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Poll `store` until the config for `target` is fetched, decoded and written.
/// Returns the path of the written file.
pub async fn fetch_config(
    store: &dyn ConfigStore,
    target: &ConfigTarget,
    key_prefix: &str,
    root: &Path,
    retry: &RetryPolicy,
) -> EntrypointResult<PathBuf> {
    let key = target.key(key_prefix);
    let path = target.config_file(root);
    let what = format!("config key '{key}'");

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fetch_once(store, &key, &path).await {
            Ok(true) => {
                info!(key = %key, path = %path.display(), "config written");
                return Ok(path);
            }
            Ok(false) => info!(key = %key, attempt, "config key not found; retrying"),
            Err(e) => warn!(key = %key, attempt, error = %e, "config fetch failed; retrying"),
        }
        retry.backoff(attempt, &what).await?;
    }
}

async fn fetch_once(store: &dyn ConfigStore, key: &str, path: &Path) -> Result<bool, StoreError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(false);
    };
    let yaml = json_to_yaml(&raw)?;
    write_atomic(path, yaml.as_bytes())?;
    Ok(true)
}

/// etcd v3 client speaking the JSON gRPC gateway.
pub struct EtcdClient {
    client: Client,
    endpoints: Vec<String>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

impl EtcdClient {
    /// `endpoints` is a comma separated list of `host:port` or URLs.
    pub fn new(endpoints: &str) -> EntrypointResult<Self> {
        let endpoints = parse_endpoints(endpoints);
        if endpoints.is_empty() {
            return Err(EntrypointError::Config("no etcd endpoints configured".into()));
        }
        let client = Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EntrypointError::Config(format!("http client: {e}")))?;

        info!(endpoints = ?endpoints, "etcd client initialized");
        Ok(Self { client, endpoints })
    }

    async fn range(&self, endpoint: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let body = RangeRequest {
            key: BASE64.encode(key),
        };
        let resp = self
            .client
            .post(format!("{endpoint}/v3/kv/range"))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Connect(format!("{endpoint}: {e}")))?;

        if !resp.status().is_success() {
            return Err(StoreError::Fetch(format!("{endpoint}: HTTP {}", resp.status())));
        }

        let range: RangeResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Fetch(format!("{endpoint}: {e}")))?;

        let Some(kv) = range.kvs.into_iter().next() else {
            return Ok(None);
        };
        BASE64
            .decode(kv.value)
            .map(Some)
            .map_err(|e| StoreError::Decode(format!("base64: {e}")))
    }
}

#[async_trait]
impl ConfigStore for EtcdClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut last_err = StoreError::Connect("no endpoints".into());
        for endpoint in &self.endpoints {
            match self.range(endpoint, key).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| {
            let e = e.trim_end_matches('/');
            if e.contains("://") {
                e.to_string()
            } else {
                format!("http://{e}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<VecDeque<Result<Option<Vec<u8>>, StoreError>>>,
        keys: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Option<Vec<u8>>, StoreError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                keys: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConfigStore for Scripted {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.keys.lock().unwrap().push(key.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn target() -> ConfigTarget {
        ConfigTarget {
            service: "scout".into(),
            datacenter: "us1".into(),
        }
    }

    #[test]
    fn target_requires_service_and_datacenter() {
        assert_eq!(ConfigTarget::from_parts(Some("scout"), Some("us1")), Some(target()));
        assert!(ConfigTarget::from_parts(None, Some("us1")).is_none());
        assert!(ConfigTarget::from_parts(Some("scout"), None).is_none());
        assert!(ConfigTarget::from_parts(Some("scout"), Some("  ")).is_none());
    }

    #[test]
    fn key_and_path_layout() {
        let t = target();
        assert_eq!(t.key("/mailgun/configs/"), "/mailgun/configs/us1/scout");
        assert_eq!(
            t.config_file(Path::new("/etc/mailgun")),
            PathBuf::from("/etc/mailgun/scout/config.yaml")
        );
    }

    #[test]
    fn json_object_becomes_yaml() {
        let yaml = json_to_yaml(br#"{"listen": ":8080", "workers": 4, "tags": ["a", "b"]}"#)
            .unwrap();
        let back: serde_json::Value = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, json!({"listen": ":8080", "workers": 4, "tags": ["a", "b"]}));
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(matches!(json_to_yaml(b"[1, 2]"), Err(StoreError::Decode(_))));
        assert!(matches!(json_to_yaml(b"not json"), Err(StoreError::Decode(_))));
    }

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout/config.yaml");

        write_atomic(&path, b"first: 1\n").unwrap();
        write_atomic(&path, b"second: 2\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second: 2\n");
        // Only the final file remains, no temp leftovers
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn written_config_is_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout/config.yaml");

        write_atomic(&path, b"port: 8080\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644, "mode: {mode:o}");
    }

    #[test]
    fn endpoints_get_a_scheme() {
        assert_eq!(
            parse_endpoints("etcd-0:2379, https://etcd-1:2379/,,"),
            vec!["http://etcd-0:2379", "https://etcd-1:2379"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_every_failure_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = Scripted::new(vec![
            Err(StoreError::Connect("connection refused".into())),
            Ok(None),
            Ok(Some(b"{broken".to_vec())),
            Ok(Some(br#"{"port": 8080}"#.to_vec())),
        ]);

        let start = tokio::time::Instant::now();
        let path = fetch_config(
            &store,
            &target(),
            "/mailgun/configs",
            dir.path(),
            &RetryPolicy::forever(Duration::from_secs(3)),
        )
        .await
        .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "elapsed: {elapsed:?}");
        assert_eq!(path, dir.path().join("scout/config.yaml"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "port: 8080\n");
        let keys = store.keys.lock().unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k == "/mailgun/configs/us1/scout"));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up_on_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Scripted::new(vec![]);
        let err = fetch_config(
            &store,
            &target(),
            "/mailgun/configs",
            dir.path(),
            &RetryPolicy::bounded(Duration::from_secs(3), 2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EntrypointError::RetriesExhausted { attempts: 2, .. }));
        assert!(!dir.path().join("scout/config.yaml").exists());
    }

    #[tokio::test]
    async fn etcd_client_reads_range_value() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v3/kv/range")
                    .json_body(json!({"key": BASE64.encode("/mailgun/configs/us1/scout")}));
                then.status(200).json_body(json!({
                    "header": {"revision": "7"},
                    "kvs": [{
                        "key": BASE64.encode("/mailgun/configs/us1/scout"),
                        "value": BASE64.encode(r#"{"port": 8080}"#),
                        "version": "3"
                    }],
                    "count": "1"
                }));
            })
            .await;

        let client = EtcdClient::new(&server.base_url()).unwrap();
        let value = client.get("/mailgun/configs/us1/scout").await.unwrap();

        mock.assert_calls_async(1).await;
        assert_eq!(value.as_deref(), Some(br#"{"port": 8080}"#.as_slice()));
    }

    #[tokio::test]
    async fn etcd_client_missing_key_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v3/kv/range");
                then.status(200).json_body(json!({"header": {"revision": "7"}}));
            })
            .await;

        let client = EtcdClient::new(&server.base_url()).unwrap();
        assert!(client.get("/mailgun/configs/us1/scout").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn etcd_client_falls_over_to_next_endpoint() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v3/kv/range");
                then.status(200).json_body(json!({
                    "kvs": [{"value": BASE64.encode("{}")}]
                }));
            })
            .await;

        // Port 1 refuses connections
        let endpoints = format!("127.0.0.1:1,{}", server.base_url());
        let client = EtcdClient::new(&endpoints).unwrap();
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some(b"{}".as_slice()));
    }

    #[test]
    fn etcd_client_needs_an_endpoint() {
        assert!(matches!(EtcdClient::new(" , "), Err(EntrypointError::Config(_))));
    }
}
