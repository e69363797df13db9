//! Demo child for the entrypoint.
//!
//! Prints its environment and fetched config, reports SIGUSR1/SIGUSR2 on
//! stdout, and exits 0 on SIGTERM. Otherwise it sleeps for an hour.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut term = signal(SignalKind::terminate())?;

    let mut out = std::io::stdout().lock();
    for (key, value) in std::env::vars() {
        writeln!(out, "{key}={value}")?;
    }

    if let Ok(service) = std::env::var("SERVICE_NAME")
        && !service.is_empty()
    {
        let root = std::env::var("CONFIG_ROOT").unwrap_or_else(|_| "/etc/mailgun".into());
        let path = PathBuf::from(root).join(&service).join("config.yaml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                writeln!(out, "-------- {} -----------", path.display())?;
                write!(out, "{contents}")?;
                writeln!(out, "-----------------------")?;
            }
            Err(e) => writeln!(out, "while reading config file '{}' - '{e}'", path.display())?,
        }
    }

    writeln!(out, "Sleeping....")?;
    out.flush()?;
    drop(out);

    let sleep = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = usr1.recv() => report("SIGUSR1")?,
            _ = usr2.recv() => report("SIGUSR2")?,
            _ = term.recv() => {
                report("SIGTERM")?;
                return Ok(());
            }
            _ = &mut sleep => return Ok(()),
        }
    }
}

fn report(name: &str) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{name}")?;
    out.flush()
}
