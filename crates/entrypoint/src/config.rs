//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::Signal;

use crate::deps::{Dependency, parse_depends_on};
use crate::discovery::PortPolicy;
use crate::pid1::ShutdownPolicy;
use crate::retry::RetryPolicy;
use crate::store::ConfigTarget;

const DEFAULT_KUBE_API_URL: &str = "https://kubernetes.default.svc";

/// PID 1 for Kubernetes containers: waits for dependencies, fetches config,
/// then runs COMMAND, relaying signals and reaping zombies.
#[derive(Debug, Parser)]
#[command(name = "entrypoint", version)]
pub struct Cli {
    /// Readiness probe: exit 0 if the ready marker exists, 1 otherwise.
    /// Takes precedence over every other option.
    #[arg(long)]
    pub ready: bool,

    /// Resolve dependencies and fetch config, then exit without running COMMAND
    #[arg(long, env = "INIT_ONLY")]
    pub init_only: bool,

    /// Comma separated `name[:port_name]` endpoints to wait for
    #[arg(long, env = "DEPENDS_ON", default_value = "")]
    pub depends_on: String,

    /// Let a dependency without a port name match any port
    #[arg(long, env = "DEPENDS_ON_ANY_PORT")]
    pub match_any_port: bool,

    #[arg(
        long,
        env = "NAMESPACE_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/namespace"
    )]
    pub namespace_file: PathBuf,

    #[arg(
        long,
        env = "KUBE_TOKEN_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub token_file: PathBuf,

    #[arg(
        long,
        env = "KUBE_CA_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
    )]
    pub ca_file: PathBuf,

    /// Kubernetes API server; derived from KUBERNETES_SERVICE_HOST/PORT when unset
    #[arg(long, env = "KUBE_API_URL")]
    pub kube_api_url: Option<String>,

    /// Seconds between endpoint lookups
    #[arg(long = "discovery-interval", env = "DISCOVERY_INTERVAL_SECS", default_value_t = 3)]
    pub discovery_interval_secs: u64,

    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    #[arg(long, env = "DC_SHORT_NAME")]
    pub dc_short_name: Option<String>,

    /// Comma separated etcd v3 endpoints
    #[arg(long, env = "ETCD_V3_ENDPOINTS", default_value = "etcd-cluster-client:2379")]
    pub etcd_endpoints: String,

    #[arg(long, env = "CONFIG_KEY_PREFIX", default_value = "/mailgun/configs")]
    pub config_key_prefix: String,

    /// Config is written to <CONFIG_ROOT>/<SERVICE_NAME>/config.yaml
    #[arg(long, env = "CONFIG_ROOT", default_value = "/etc/mailgun")]
    pub config_root: PathBuf,

    /// Seconds between config fetch attempts
    #[arg(long = "config-interval", env = "CONFIG_INTERVAL_SECS", default_value_t = 3)]
    pub config_interval_secs: u64,

    #[arg(long, env = "READY_FILE", default_value = "/tmp/entrypoint.ready")]
    pub ready_file: PathBuf,

    /// Signal that starts the two-phase shutdown
    #[arg(long, env = "STOP_SIGNAL", default_value = "SIGTERM", value_parser = parse_signal)]
    pub stop_signal: Signal,

    /// Signal sent to the child as soon as the stop signal arrives
    #[arg(long, env = "PRE_STOP_SIGNAL", default_value = "SIGUSR1", value_parser = parse_signal)]
    pub pre_stop_signal: Signal,

    /// Seconds between the pre-stop signal and the relayed stop signal
    #[arg(long = "grace-period", env = "SHUTDOWN_GRACE_SECS", default_value_t = 3)]
    pub grace_period_secs: u64,

    /// Command to supervise, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Accepts `TERM`, `SIGTERM`, `sigterm` or a signal number.
pub fn parse_signal(raw: &str) -> Result<Signal, String> {
    let raw = raw.trim();
    if let Ok(num) = raw.parse::<i32>() {
        return Signal::try_from(num).map_err(|e| format!("signal {num}: {e}"));
    }
    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    name.parse::<Signal>()
        .map_err(|_| format!("unknown signal '{raw}'"))
}

/// In-cluster API server address from the variables the kubelet injects.
pub fn api_url_from(host: Option<&str>, port: Option<&str>) -> String {
    match (host, port) {
        (Some(host), Some(port)) if !host.is_empty() && !port.is_empty() => {
            if host.contains(':') {
                format!("https://[{host}]:{port}")
            } else {
                format!("https://{host}:{port}")
            }
        }
        _ => DEFAULT_KUBE_API_URL.to_string(),
    }
}

impl Cli {
    pub fn dependencies(&self) -> Vec<Dependency> {
        parse_depends_on(&self.depends_on)
    }

    pub fn kube_api_url(&self) -> String {
        if let Some(url) = self.kube_api_url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").ok();
        api_url_from(host.as_deref(), port.as_deref())
    }

    pub fn port_policy(&self) -> PortPolicy {
        if self.match_any_port {
            PortPolicy::AnyPort
        } else {
            PortPolicy::Strict
        }
    }

    pub fn discovery_retry(&self) -> RetryPolicy {
        RetryPolicy::forever(Duration::from_secs(self.discovery_interval_secs))
    }

    pub fn config_retry(&self) -> RetryPolicy {
        RetryPolicy::forever(Duration::from_secs(self.config_interval_secs))
    }

    pub fn config_target(&self) -> Option<ConfigTarget> {
        ConfigTarget::from_parts(self.service_name.as_deref(), self.dc_short_name.as_deref())
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            stop_signal: self.stop_signal,
            pre_stop_signal: self.pre_stop_signal,
            grace: Duration::from_secs(self.grace_period_secs),
        }
    }
}
