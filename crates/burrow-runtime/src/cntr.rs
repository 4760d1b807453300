//! The container and manager surfaces.
//!
//! Implemented locally by [`crate::LocalCntr`] and [`crate::CntrManager`],
//! and remotely by the client-side proxy, so callers cannot tell which
//! one they hold.

use std::sync::Arc;

use burrow_common::error::Result;
use burrow_common::types::{CntrSpec, Cntrinfo, Taskinfo};

use crate::attach::Attacher;

/// Visitor over task ids.
pub type TaskVisitor<'a> = dyn FnMut(&str) -> Result<()> + 'a;

/// Visitor over container descriptions.
pub type CntrVisitor<'a> = dyn FnMut(&Cntrinfo) -> Result<()> + 'a;

/// One container and the tasks running in it.
pub trait Cntr: Send + Sync {
    /// Returns the container description.
    ///
    /// # Errors
    ///
    /// Returns an error if the description cannot be fetched.
    fn meta(&self) -> Result<Cntrinfo>;

    /// Starts a task and returns its id.
    ///
    /// The first task of a container creates its namespaces; later tasks
    /// enter them.
    ///
    /// # Errors
    ///
    /// Returns an error if the task description is invalid or the process
    /// cannot be spawned.
    fn start(&self, task: &Taskinfo) -> Result<String>;

    /// Signals a task (terminate, or kill if `kill`) and closes its stdin.
    /// Stopping an unknown or finished task succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn stop(&self, task: &str, kill: bool) -> Result<()>;

    /// Signals every process of the container and closes every task's
    /// pipes. Succeeds when nothing is running.
    ///
    /// # Errors
    ///
    /// Returns the last signal delivery error.
    fn stop_all(&self, kill: bool) -> Result<()>;

    /// Blocks until every started task has been reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting is interrupted.
    fn wait(&self) -> Result<()>;

    /// Opens a stream onto a live task's stdio.
    ///
    /// # Errors
    ///
    /// Returns [`burrow_common::error::BurrowError::NotFound`] if the task
    /// is not currently running.
    fn attach(&self, task: &str) -> Result<Box<dyn Attacher>>;

    /// Visits the ids of live tasks. A visitor error stops the walk and is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the visitor's error.
    fn list(&self, visit: &mut TaskVisitor<'_>) -> Result<()>;
}

/// Factory and registry of containers.
pub trait Manager: Send + Sync {
    /// Returns the identity of the node behind this manager; empty when
    /// the manager spans several nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be fetched.
    fn id(&self) -> Result<String>;

    /// Creates a container and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be materialized.
    fn create(&self, spec: &CntrSpec) -> Result<String>;

    /// Looks up a container.
    ///
    /// # Errors
    ///
    /// Returns [`burrow_common::error::BurrowError::NotFound`] for unknown ids.
    fn get(&self, id: &str) -> Result<Arc<dyn Cntr>>;

    /// Destroys a container and forgets it.
    ///
    /// # Errors
    ///
    /// Returns [`burrow_common::error::BurrowError::NotFound`] for unknown
    /// ids, or the teardown error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Visits containers matching `query`. See [`crate::query`].
    ///
    /// # Errors
    ///
    /// Returns a query syntax error or the visitor's error.
    fn list(&self, query: &str, visit: &mut CntrVisitor<'_>) -> Result<()>;

    /// Replaces a container's tags.
    ///
    /// # Errors
    ///
    /// Returns [`burrow_common::error::BurrowError::StaleWrite`] if the
    /// description changed concurrently.
    fn update_tags(&self, id: &str, tags: Vec<String>) -> Result<()>;

    /// Destroys every container, best effort.
    ///
    /// # Errors
    ///
    /// Returns the last teardown error.
    fn close(&self) -> Result<()>;
}
