//! `burrowd serve` — Serve this node's containers until interrupted.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use burrow_common::config::{ConsulConfig, NodeConfig, RuntimeKind};
use burrow_common::constants::CGROUP_V2_PATH;
use burrow_remote::{CntrService, ServiceOptions};
use burrow_runtime::{CntrManager, Manager, ManagerOptions, backend};
use burrow_store::registry::{Announce, ConsulDiscovery};
use burrow_store::{JsonStore, Store};
use clap::Args;

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Node configuration file (JSON).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Control channel listen address.
    #[arg(long)]
    pub listen: Option<String>,

    /// Attach listener address.
    #[arg(long)]
    pub attach: Option<String>,

    /// Data directory holding the store and relative root filesystems.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Runtime backend: `namespace` or `host`.
    #[arg(long)]
    pub runtime: Option<RuntimeKind>,

    /// Run without root even when started as root.
    #[arg(long)]
    pub rootless: bool,
}

/// Builds the effective configuration: file, then flags.
fn configure(args: ServeArgs, consul: Option<String>) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(attach) = args.attach {
        config.attach_addr = attach;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(runtime) = args.runtime {
        config.runtime = runtime;
    }
    if let Some(address) = consul {
        config.consul = Some(ConsulConfig::new(address));
    }
    config.rootless = config.rootless || args.rootless || !nix::unistd::geteuid().is_root();
    config.validate()?;
    Ok(config)
}

/// Executes the `serve` command.
///
/// # Errors
///
/// Returns an error if the store, manager, or listeners cannot be set up.
pub fn execute(args: ServeArgs, consul: Option<String>) -> anyhow::Result<()> {
    let config = configure(args, consul)?;
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&config.store_path())?);
    let manager = Arc::new(CntrManager::open(
        Arc::clone(&store),
        backend::select(config.runtime, Path::new(CGROUP_V2_PATH)),
        ManagerOptions {
            data_dir: config.data_dir.clone(),
            rootless: config.rootless,
        },
    )?);

    let announce: Option<Arc<dyn Announce>> = match &config.consul {
        Some(consul) => {
            let discovery = ConsulDiscovery::new(&consul.address, &consul.service_name)?;
            Some(Arc::new(discovery) as Arc<dyn Announce>)
        }
        None => None,
    };
    let control = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("binding control address {}", config.listen_addr))?;
    let attach = TcpListener::bind(&config.attach_addr)
        .with_context(|| format!("binding attach address {}", config.attach_addr))?;
    let service = CntrService::start(
        Arc::clone(&manager) as Arc<dyn Manager>,
        control,
        attach,
        ServiceOptions::from_config(&config),
        announce,
    )?;
    tracing::info!(
        id = %manager.node_id(),
        control = %service.control_addr(),
        attach = %service.attach_addr(),
        runtime = ?config.runtime,
        rootless = config.rootless,
        "node serving"
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(250));
    }

    tracing::info!("shutting down");
    if let Err(e) = service.shutdown() {
        tracing::warn!(error = %e, "withdrawing announcement failed");
    }
    if let Err(e) = manager.close() {
        tracing::warn!(error = %e, "container teardown incomplete");
    }
    store.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            config: None,
            listen: None,
            attach: None,
            data_dir: None,
            runtime: None,
            rootless: false,
        }
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"listen_addr":"0.0.0.0:9000","runtime":"namespace"}"#).unwrap();

        let config = configure(
            ServeArgs {
                config: Some(path),
                runtime: Some(RuntimeKind::Host),
                rootless: true,
                ..args()
            },
            Some("http://consul:8500".into()),
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.runtime, RuntimeKind::Host);
        assert!(config.rootless);
        assert_eq!(config.consul.unwrap().service_name, "burrow");
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let config = configure(args(), None).unwrap();
        assert_eq!(config.listen_addr, burrow_common::constants::DEFAULT_LISTEN_ADDR);
    }
}
