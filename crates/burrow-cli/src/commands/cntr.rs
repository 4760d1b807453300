//! Container commands: `create`, `ls`, `meta`, `tag`, `rm`.

use std::path::PathBuf;

use anyhow::Context;
use burrow_common::meta::Metainfo;
use burrow_common::types::CntrSpec;
use burrow_runtime::Manager;
use clap::Args;

/// Arguments naming one container.
#[derive(Args, Debug)]
pub struct IdArgs {
    /// Container id.
    pub id: String,
}

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Unpacked root filesystem; relative paths resolve under the node's
    /// rootfs directory.
    #[arg(long)]
    pub rootfs: String,

    /// Container template as a JSON file.
    #[arg(long)]
    pub meta: Option<PathBuf>,

    /// Container name, overriding the template.
    #[arg(long)]
    pub name: Option<String>,

    /// Hostname, overriding the template.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Tag to attach; repeatable.
    #[arg(long = "tag", short)]
    pub tags: Vec<String>,
}

/// Arguments for the `ls` command.
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Query terms such as `tags=web meta.name=nginx`.
    #[arg(trailing_var_arg = true)]
    pub query: Vec<String>,
}

/// Arguments for the `tag` command.
#[derive(Args, Debug)]
pub struct TagArgs {
    /// Container id.
    pub id: String,

    /// The complete new tag set.
    pub tags: Vec<String>,
}

/// Creates a container and prints its id.
///
/// # Errors
///
/// Returns an error if the template cannot be read or creation fails.
pub fn create(manager: &dyn Manager, args: CreateArgs) -> anyhow::Result<()> {
    let mut meta = match &args.meta {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading template {}", path.display()))?;
            serde_json::from_str::<Metainfo>(&raw)
                .with_context(|| format!("parsing template {}", path.display()))?
        }
        None => Metainfo::default(),
    };
    if let Some(name) = args.name {
        meta.name = name;
    }
    if let Some(hostname) = args.hostname {
        meta.hostname = hostname;
    }

    let id = manager.create(&CntrSpec {
        rootfs: args.rootfs,
        tags: args.tags,
        meta,
    })?;
    println!("{id}");
    Ok(())
}

/// Lists matching containers.
///
/// # Errors
///
/// Returns an error if the query is malformed or the node fails.
pub fn ls(manager: &dyn Manager, args: &LsArgs) -> anyhow::Result<()> {
    let query = args.query.join(" ");
    let mut rows = Vec::new();
    manager.list(&query, &mut |info| {
        rows.push((
            info.id.clone(),
            info.meta.name.clone(),
            info.tags.join(","),
            info.rootfs.clone(),
        ));
        Ok(())
    })?;

    if rows.is_empty() {
        println!("No containers found.");
        return Ok(());
    }
    println!("{:<44} {:<16} {:<20} {:<30}", "CONTAINER ID", "NAME", "TAGS", "ROOTFS");
    for (id, name, tags, rootfs) in &rows {
        println!("{id:<44} {name:<16} {tags:<20} {rootfs:<30}");
    }
    Ok(())
}

/// Prints a container's description.
///
/// # Errors
///
/// Returns an error if the container is unknown.
pub fn meta(manager: &dyn Manager, args: &IdArgs) -> anyhow::Result<()> {
    let info = manager.get(&args.id)?.meta()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// Replaces a container's tags.
///
/// # Errors
///
/// Returns an error if the container is unknown or changed concurrently.
pub fn tag(manager: &dyn Manager, args: TagArgs) -> anyhow::Result<()> {
    manager.update_tags(&args.id, args.tags)?;
    Ok(())
}

/// Destroys a container.
///
/// # Errors
///
/// Returns an error if the container is unknown or teardown fails.
pub fn rm(manager: &dyn Manager, args: &IdArgs) -> anyhow::Result<()> {
    manager.delete(&args.id)?;
    tracing::info!(id = %args.id, "container removed");
    Ok(())
}
