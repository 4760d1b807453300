//! CLI command definitions and dispatch.

pub mod attach;
pub mod cntr;
pub mod serve;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use burrow_common::config::ConsulConfig;
use burrow_common::constants::{DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_LISTEN_ADDR};
use burrow_remote::{CntrProxy, ProxyOptions};
use burrow_store::registry::{ConsulDiscovery, ConsulRegistry, Node};
use clap::{Parser, Subcommand};

/// burrowd — distributed container runtime node and client.
#[derive(Parser, Debug)]
#[command(name = "burrowd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Control address of the node client commands talk to.
    #[arg(long, global = true, env = "BURROW_PEER", default_value = DEFAULT_LISTEN_ADDR)]
    pub peer: String,

    /// Deadline in seconds for each remote call.
    #[arg(long, global = true, default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Consul agent address. Client commands span every registered node
    /// instead of `--peer`; `serve` registers with it.
    #[arg(long, global = true, env = "BURROW_CONSUL")]
    pub consul: Option<String>,
}

/// Builds a proxy onto `peer`, or onto the whole cluster when a Consul
/// agent is given.
fn proxy(peer: String, timeout: u64, consul: Option<String>) -> anyhow::Result<CntrProxy> {
    let options = ProxyOptions {
        call_timeout: Duration::from_secs(timeout),
        wait_timeout: None,
    };
    let Some(address) = consul else {
        return Ok(CntrProxy::single(Node::at(peer), options));
    };
    let consul = ConsulConfig::new(address);
    let discovery = ConsulDiscovery::new(&consul.address, &consul.service_name)?;
    let registry = ConsulRegistry::new(&consul.address, &consul.kv_prefix)?;
    Ok(CntrProxy::new(Arc::new(discovery), Arc::new(registry), options))
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve this node's containers.
    Serve(serve::ServeArgs),
    /// Create a container.
    Create(cntr::CreateArgs),
    /// List containers matching a query.
    Ls(cntr::LsArgs),
    /// Print a container's description as JSON.
    Meta(cntr::IdArgs),
    /// Replace a container's tags.
    Tag(cntr::TagArgs),
    /// Destroy a container.
    Rm(cntr::IdArgs),
    /// Start a task in a container.
    Start(task::StartArgs),
    /// Stop a task.
    Stop(task::StopArgs),
    /// Stop every task of a container.
    StopAll(task::StopAllArgs),
    /// Wait until every task of a container has finished.
    Wait(cntr::IdArgs),
    /// List the live tasks of a container.
    Tasks(cntr::IdArgs),
    /// Connect the terminal to a task's stdio.
    Attach(attach::AttachArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        peer,
        timeout,
        consul,
    } = cli;
    if let Command::Serve(args) = command {
        return serve::execute(args, consul);
    }

    let proxy = proxy(peer, timeout, consul)?;
    match command {
        Command::Serve(_) => Ok(()),
        Command::Create(args) => cntr::create(&proxy, args),
        Command::Ls(args) => cntr::ls(&proxy, &args),
        Command::Meta(args) => cntr::meta(&proxy, &args),
        Command::Tag(args) => cntr::tag(&proxy, args),
        Command::Rm(args) => cntr::rm(&proxy, &args),
        Command::Start(args) => task::start(&proxy, args),
        Command::Stop(args) => task::stop(&proxy, &args),
        Command::StopAll(args) => task::stop_all(&proxy, &args),
        Command::Wait(args) => task::wait(&proxy, &args),
        Command::Tasks(args) => task::list(&proxy, &args),
        Command::Attach(args) => attach::execute(&proxy, &args),
    }
}
