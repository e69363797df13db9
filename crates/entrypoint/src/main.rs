//! Entrypoint: PID 1 for a single-service container.
//!
//! Startup sequence:
//! 1. Wait for every `DEPENDS_ON` endpoint and export `<NAME>_HOSTS` / `<NAME>_PORT`
//! 2. Fetch the service config from etcd (when `SERVICE_NAME` and `DC_SHORT_NAME` are set)
//! 3. Write the ready marker
//! 4. Spawn COMMAND, relay signals to it, reap zombies, exit with its code

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use entrypoint::config::Cli;
use entrypoint::deps::{DependencyGate, ProcessEnv};
use entrypoint::discovery::{self, KubeClient};
use entrypoint::error::{EntrypointError, EntrypointResult};
use entrypoint::store::{self, EtcdClient};
use entrypoint::{log, pid1, ready};

// Single-threaded: the dependency gate mutates the process environment.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.ready {
        return if ready::is_ready(&cli.ready_file) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    log::init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, code = e.exit_code(), "startup failed");
            ExitCode::from(&e)
        }
    }
}

async fn run(cli: Cli) -> EntrypointResult<u8> {
    if !cli.init_only && cli.command.is_empty() {
        return Err(EntrypointError::Config(
            "no command given; usage: entrypoint <command> [args...]".into(),
        ));
    }

    let exported = wait_for_dependencies(&cli).await?;

    match cli.config_target() {
        Some(target) => {
            let etcd = EtcdClient::new(&cli.etcd_endpoints)?;
            store::fetch_config(
                &etcd,
                &target,
                &cli.config_key_prefix,
                &cli.config_root,
                &cli.config_retry(),
            )
            .await?;
        }
        None => info!("config fetch not configured"),
    }

    if cli.init_only {
        for (key, value) in &exported {
            println!("{key}={value}");
        }
        info!("init complete; not starting a child");
        return Ok(0);
    }

    ready::mark_ready(&cli.ready_file)?;
    pid1::supervise(&cli.command, cli.shutdown_policy()).await
}

async fn wait_for_dependencies(cli: &Cli) -> EntrypointResult<Vec<(String, String)>> {
    let deps = cli.dependencies();
    if deps.is_empty() {
        info!("DEPENDS_ON not set or empty; skipping dependency check");
        return Ok(Vec::new());
    }

    let namespace = discovery::read_namespace(&cli.namespace_file).await?;
    let kube =
        KubeClient::from_service_account(cli.kube_api_url(), &cli.token_file, &cli.ca_file)
            .await?;

    info!(count = deps.len(), namespace = %namespace, "waiting for dependencies");
    DependencyGate::new(&kube, namespace, cli.port_policy(), cli.discovery_retry())
        .run(deps, &mut ProcessEnv)
        .await
}
