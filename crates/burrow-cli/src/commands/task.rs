//! Task commands: `start`, `stop`, `stop-all`, `wait`, `tasks`.

use burrow_common::types::Taskinfo;
use burrow_runtime::Manager;
use clap::Args;

use super::cntr::IdArgs;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container id.
    pub id: String,

    /// Environment entry `KEY=VALUE`; repeatable.
    #[arg(long = "env", short)]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(long)]
    pub cwd: Option<String>,

    /// Capability the task keeps; repeatable.
    #[arg(long = "cap")]
    pub capabilities: Vec<String>,

    /// Terminal rows exported as `LINES`.
    #[arg(long, default_value_t = 0)]
    pub rows: u16,

    /// Terminal columns exported as `COLUMNS`.
    #[arg(long, default_value_t = 0)]
    pub cols: u16,

    /// Program and arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container id.
    pub id: String,

    /// Task id.
    pub task: String,

    /// Kill instead of terminating.
    #[arg(short, long)]
    pub kill: bool,
}

/// Arguments for the `stop-all` command.
#[derive(Args, Debug)]
pub struct StopAllArgs {
    /// Container id.
    pub id: String,

    /// Kill instead of terminating.
    #[arg(short, long)]
    pub kill: bool,
}

/// Starts a task and prints its id.
///
/// # Errors
///
/// Returns an error if the container is unknown or the task cannot start.
pub fn start(manager: &dyn Manager, args: StartArgs) -> anyhow::Result<()> {
    let task = manager.get(&args.id)?.start(&Taskinfo {
        args: args.command,
        env: args.env,
        cwd: args.cwd,
        capabilities: args.capabilities,
        rlimits: Vec::new(),
        term_height: args.rows,
        term_width: args.cols,
    })?;
    println!("{task}");
    Ok(())
}

/// Stops one task.
///
/// # Errors
///
/// Returns an error if the container is unknown or the signal fails.
pub fn stop(manager: &dyn Manager, args: &StopArgs) -> anyhow::Result<()> {
    manager.get(&args.id)?.stop(&args.task, args.kill)?;
    Ok(())
}

/// Stops every task of a container.
///
/// # Errors
///
/// Returns an error if the container is unknown or a signal fails.
pub fn stop_all(manager: &dyn Manager, args: &StopAllArgs) -> anyhow::Result<()> {
    manager.get(&args.id)?.stop_all(args.kill)?;
    Ok(())
}

/// Blocks until every task of a container has finished.
///
/// # Errors
///
/// Returns an error if the container is unknown or the node goes away.
pub fn wait(manager: &dyn Manager, args: &IdArgs) -> anyhow::Result<()> {
    manager.get(&args.id)?.wait()?;
    Ok(())
}

/// Prints the ids of live tasks.
///
/// # Errors
///
/// Returns an error if the container is unknown.
pub fn list(manager: &dyn Manager, args: &IdArgs) -> anyhow::Result<()> {
    manager.get(&args.id)?.list(&mut |task| {
        println!("{task}");
        Ok(())
    })?;
    Ok(())
}
