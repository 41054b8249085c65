use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::sm::build_info;
use crate::sm::config::{self, ConfigListener, ConfigStore};
use crate::sm::events::{self, sm_event};
use crate::sm::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "servicemaster", version, about = "local service supervisor")]
pub struct Args {
    /// Path to the services document
    #[arg(short = 'c', long = "config", default_value = "services.yaml")]
    pub config: PathBuf,
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // An unparseable document at startup is fatal.
    let settings = config::load_global(&args.config)?;

    let addr = format!("{}:{}", settings.host, settings.port);
    ensure_addr_free(&addr)?;

    events::start_log_writer(Path::new("logs"));
    sm_event("boot", None, build_info::banner());
    sm_event(
        "boot",
        None,
        format!(
            "config={} addr={addr} failure_retries={} webhook={}",
            args.config.display(),
            settings.failure_retries,
            settings.failure_webhook_url.as_deref().unwrap_or("-")
        ),
    );

    let supervisor = Supervisor::new(settings);
    let store = Arc::new(ConfigStore::new(&args.config));
    Arc::clone(&store).start_watcher(Arc::clone(&supervisor) as Arc<dyn ConfigListener>)?;
    sm_event(
        "boot",
        None,
        format!("watching {} for changes", args.config.display()),
    );

    tokio::signal::ctrl_c().await?;
    sm_event("shutdown", None, "signal received; shutting down");

    store.stop();
    supervisor.shutdown().await;
    sm_event("shutdown", None, "servicemaster stopped");
    Ok(())
}

/// Fail fast when another instance already holds the configured address.
fn ensure_addr_free(addr: &str) -> anyhow::Result<()> {
    match std::net::TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => anyhow::bail!(
            "address {addr} is unavailable ({e}); another instance may be running"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_check_detects_a_taken_port() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap().to_string();
        assert!(ensure_addr_free(&addr).is_err());
        drop(holder);
        assert!(ensure_addr_free(&addr).is_ok());
    }
}
