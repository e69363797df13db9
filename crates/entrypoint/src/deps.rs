//! Declared dependencies and the startup gate that waits for them.

use tracing::{info, warn};

use crate::discovery::{self, Discovery, PortPolicy};
use crate::error::EntrypointResult;
use crate::retry::RetryPolicy;

/// An upstream service the child needs before it can start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependency {
    /// Endpoint name, e.g. `kafka` or `cassandra-aux`.
    pub name: String,
    /// Named port to look for on the endpoint.
    pub port_name: String,
    /// Resolved hosts, in endpoint order.
    pub hosts: Vec<String>,
    /// Resolved port number.
    pub port: Option<u16>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// `<NAME>_HOSTS` and `<NAME>_PORT` for a resolved dependency.
    pub fn exports(&self) -> [(String, String); 2] {
        let prefix = self.name.to_uppercase();
        [
            (format!("{prefix}_HOSTS"), self.hosts.join(",")),
            (
                format!("{prefix}_PORT"),
                self.port.map(|p| p.to_string()).unwrap_or_default(),
            ),
        ]
    }
}

/// Parse a `DEPENDS_ON` value: comma separated `name` or `name:port_name`.
pub fn parse_depends_on(raw: &str) -> Vec<Dependency> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| {
            if item.is_empty() {
                return false;
            }
            if item.starts_with(':') {
                warn!(entry = item, "ignoring dependency without a name");
                return false;
            }
            true
        })
        .map(|item| {
            let mut parts = item.split(':');
            let name = parts.next().unwrap_or_default();
            let port_name = parts.next().unwrap_or_default();
            if port_name.is_empty() {
                warn!(dependency = name, "dependency declares no port name");
            }
            Dependency::new(name, port_name)
        })
        .collect()
}

/// Where resolved dependency variables end up.
pub trait EnvSink {
    fn set(&mut self, key: &str, value: &str);
}

/// Writes into this process's environment, inherited by the child at spawn.
pub struct ProcessEnv;

impl EnvSink for ProcessEnv {
    fn set(&mut self, key: &str, value: &str) {
        // SAFETY: the gate runs to completion on the single-threaded startup
        // runtime before the supervisor spawns anything, and between lookups
        // no request is in flight, so nothing reads the environment concurrently.
        unsafe { std::env::set_var(key, value) };
    }
}

impl EnvSink for Vec<(String, String)> {
    fn set(&mut self, key: &str, value: &str) {
        self.push((key.to_string(), value.to_string()));
    }
}

/// Resolves dependencies one after another and publishes their addresses.
pub struct DependencyGate<'a> {
    discovery: &'a dyn Discovery,
    namespace: String,
    policy: PortPolicy,
    retry: RetryPolicy,
}

impl<'a> DependencyGate<'a> {
    pub fn new(
        discovery: &'a dyn Discovery,
        namespace: impl Into<String>,
        policy: PortPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            discovery,
            namespace: namespace.into(),
            policy,
            retry,
        }
    }

    /// Resolve `deps` in declaration order. Each resolved dependency is
    /// written to `env` before the next lookup starts; the first fatal error
    /// stops the gate. Returns every exported variable, in order.
    pub async fn run(
        &self,
        deps: Vec<Dependency>,
        env: &mut dyn EnvSink,
    ) -> EntrypointResult<Vec<(String, String)>> {
        let mut exported = Vec::with_capacity(deps.len() * 2);
        for mut dep in deps {
            discovery::resolve(
                self.discovery,
                &self.namespace,
                &mut dep,
                self.policy,
                &self.retry,
            )
            .await?;

            for (key, value) in dep.exports() {
                info!(dependency = %dep.name, key = %key, value = %value, "exporting");
                env.set(&key, &value);
                exported.push((key, value));
            }
        }
        Ok(exported)
    }
}
