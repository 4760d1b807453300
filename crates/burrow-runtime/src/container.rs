//! A node-local container and its task table.

use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, PoisonError};

use burrow_common::constants::DEFAULT_TASK_PATH;
use burrow_common::error::{BurrowError, Result};
use burrow_common::meta::Rlimit;
use burrow_common::types::{Cntrinfo, Taskinfo};
use burrow_core::capability;
use nix::sys::signal::Signal;

use crate::attach::Attacher;
use crate::backend::{ProcessSpec, RuntimeContainer};
use crate::baseline::RuntimeConfig;
use crate::cntr::{Cntr, TaskVisitor};
use crate::task::{self, Task};

/// Tasks of one container, shared with the reaper threads.
#[derive(Debug, Default)]
struct Shared {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    pending: Mutex<usize>,
    drained: Condvar,
}

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<Task>>> {
        relock(self.tasks.lock())
    }

    fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks().values().cloned().collect()
    }

    /// Reaps one task: waits for it to exit, forgets it, and only then
    /// releases its pid.
    fn reap(&self, task: &Arc<Task>, mut child: Child) {
        task::wait_exited(task.pid());
        let id = task.id();
        {
            let mut tasks = self.tasks();
            if tasks.get(&id).is_some_and(|current| Arc::ptr_eq(current, task)) {
                let _ = tasks.remove(&id);
            }
        }
        task.close();
        match child.wait() {
            Ok(status) => tracing::debug!(task = %id, %status, "task exited"),
            Err(e) => tracing::warn!(task = %id, error = %e, "cannot reap task"),
        }
        let mut pending = relock(self.pending.lock());
        *pending = pending.saturating_sub(1);
        self.drained.notify_all();
    }

    /// Kills and reaps a task that has no reaper, then forgets it.
    fn abandon(&self, task: &Arc<Task>) {
        let id = task.id();
        if let Err(e) = task.signal(true) {
            tracing::warn!(task = %id, error = %e, "cannot kill unwatched task");
        }
        crate::task::reap_pid(task.pid());
        task.close();
        {
            let mut tasks = self.tasks();
            if tasks.get(&id).is_some_and(|current| Arc::ptr_eq(current, task)) {
                let _ = tasks.remove(&id);
            }
        }
        let mut pending = relock(self.pending.lock());
        *pending = pending.saturating_sub(1);
        self.drained.notify_all();
    }
}

/// A container owned by this node.
pub struct LocalCntr {
    info: Mutex<Cntrinfo>,
    config: RuntimeConfig,
    runtime: Box<dyn RuntimeContainer>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalCntr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCntr")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl LocalCntr {
    /// Wraps a materialized container.
    pub fn new(info: Cntrinfo, config: RuntimeConfig, runtime: Box<dyn RuntimeContainer>) -> Self {
        Self {
            info: Mutex::new(info),
            config,
            runtime,
            shared: Arc::new(Shared::default()),
        }
    }

    /// The container id.
    pub fn id(&self) -> String {
        relock(self.info.lock()).id.clone()
    }

    /// Replaces the tags reported by [`Cntr::meta`].
    pub fn set_tags(&self, tags: Vec<String>) {
        relock(self.info.lock()).tags = tags;
    }

    /// Kills every task, waits for them, and releases the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's resources cannot be released.
    pub fn destroy(&self) -> Result<()> {
        if let Err(e) = self.stop_all(true) {
            tracing::warn!(id = %self.id(), error = %e, "cannot kill every task");
        }
        self.wait()?;
        self.runtime.destroy()?;
        tracing::info!(id = %self.id(), "container destroyed");
        Ok(())
    }

    fn process_spec(&self, task: &Taskinfo, init_pid: Option<i32>) -> Result<ProcessSpec> {
        if task.args.first().is_none_or(String::is_empty) {
            return Err(BurrowError::InvalidArgument {
                message: "task needs a program to run".into(),
            });
        }
        let mut env = Vec::with_capacity(task.env.len() + 3);
        for entry in &task.env {
            let (key, value) = entry
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| BurrowError::InvalidArgument {
                    message: format!("environment entry {entry:?} is not KEY=VALUE"),
                })?;
            env.push((key.to_string(), value.to_string()));
        }
        let mut defaults = vec![("PATH", DEFAULT_TASK_PATH.to_string())];
        if task.term_height > 0 {
            defaults.push(("LINES", task.term_height.to_string()));
        }
        if task.term_width > 0 {
            defaults.push(("COLUMNS", task.term_width.to_string()));
        }
        for (key, value) in defaults {
            if !env.iter().any(|(k, _)| k == key) {
                env.push((key.to_string(), value));
            }
        }

        let capabilities = capability::effective_allowlist(&task.capabilities, &self.config.capabilities);
        capability::validate(&capabilities)?;
        burrow_core::rlimit::validate(&task.rlimits)?;
        Ok(ProcessSpec {
            args: task.args.clone(),
            env,
            cwd: task.cwd.clone().unwrap_or_else(|| "/".to_string()),
            init_pid,
            capabilities,
            rlimits: merge_rlimits(&self.config.rlimits, &task.rlimits),
        })
    }
}

/// Template limits overridden by task limits of the same kind.
fn merge_rlimits(template: &[Rlimit], task: &[Rlimit]) -> Vec<Rlimit> {
    let mut merged: Vec<Rlimit> = template
        .iter()
        .filter(|limit| !task.iter().any(|t| t.kind == limit.kind))
        .cloned()
        .collect();
    merged.extend(task.iter().cloned());
    merged
}

impl Cntr for LocalCntr {
    fn meta(&self) -> Result<Cntrinfo> {
        Ok(relock(self.info.lock()).clone())
    }

    fn start(&self, info: &Taskinfo) -> Result<String> {
        let mut tasks = self.shared.tasks();
        // The first live task, or the one that takes over when every
        // earlier task has exited, creates fresh namespaces.
        let init_pid = tasks.values().next().map(|task| task.pid());
        let process = self.process_spec(info, init_pid)?;
        let (task, child) = Task::spawn(self.runtime.as_ref(), &process)?;
        let task = Arc::new(task);
        let id = task.id();
        if let Some(stale) = tasks.insert(id.clone(), Arc::clone(&task)) {
            tracing::warn!(task = %id, "replacing a task with a reused pid");
            stale.close();
        }
        *relock(self.shared.pending.lock()) += 1;
        drop(tasks);

        let shared = Arc::clone(&self.shared);
        let watched = Arc::clone(&task);
        let reaper = std::thread::Builder::new()
            .name(format!("reap-{id}"))
            .spawn(move || shared.reap(&watched, child));
        if let Err(e) = reaper {
            // The `Child` was dropped with the closure.
            self.shared.abandon(&task);
            return Err(BurrowError::Runtime {
                message: format!("cannot watch task {id}: {e}"),
            });
        }
        tracing::info!(cntr = %self.id(), task = %id, init = init_pid.is_none(), "task started");
        Ok(id)
    }

    fn stop(&self, task: &str, kill: bool) -> Result<()> {
        let Some(found) = self.shared.tasks().get(task).cloned() else {
            return Ok(());
        };
        found.signal(kill)?;
        found.close_stdin();
        tracing::debug!(cntr = %self.id(), task, kill, "task stopped");
        Ok(())
    }

    fn stop_all(&self, kill: bool) -> Result<()> {
        let tasks = self.shared.snapshot();
        let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        let mut last = None;
        for task in &tasks {
            if let Err(e) = task.signal(kill) {
                last = Some(e);
            }
        }
        if let Err(e) = self.runtime.signal(signal) {
            last = Some(e);
        }
        for task in &tasks {
            task.close();
        }
        tracing::debug!(cntr = %self.id(), count = tasks.len(), kill, "all tasks stopped");
        last.map_or(Ok(()), Err)
    }

    fn wait(&self) -> Result<()> {
        let mut pending = relock(self.shared.pending.lock());
        while *pending > 0 {
            pending = self
                .shared
                .drained
                .wait(pending)
                .map_err(|_| BurrowError::lock_poisoned("task wait"))?;
        }
        Ok(())
    }

    fn attach(&self, task: &str) -> Result<Box<dyn Attacher>> {
        self.shared
            .tasks()
            .get(task)
            .map(|found| found.attacher())
            .ok_or_else(|| BurrowError::NotFound {
                kind: "task",
                id: task.to_string(),
            })
    }

    fn list(&self, visit: &mut TaskVisitor<'_>) -> Result<()> {
        let mut ids: Vec<String> = self.shared.tasks().keys().cloned().collect();
        ids.sort_by_key(|id| id.parse::<i64>().unwrap_or(i64::MAX));
        for id in &ids {
            visit(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostRuntime, Runtime};
    use crate::baseline::{BaselineOptions, assemble};
    use burrow_common::meta::Metainfo;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;

    fn cntr() -> LocalCntr {
        let config = assemble(
            &Metainfo::default(),
            Path::new("/"),
            &BaselineOptions::current(true),
        );
        let runtime = HostRuntime::new().create("n,1", &config).expect("create");
        let info = Cntrinfo {
            id: "n,1".into(),
            rootfs: "/".into(),
            tags: Vec::new(),
            meta: Metainfo::default(),
            created_at: String::new(),
        };
        LocalCntr::new(info, config, runtime)
    }

    fn task_ids(cntr: &LocalCntr) -> Vec<String> {
        let mut ids = Vec::new();
        cntr.list(&mut |id| {
            ids.push(id.to_string());
            Ok(())
        })
        .unwrap();
        ids
    }

    #[test]
    fn finished_task_disappears_after_wait() {
        let cntr = cntr();
        let id = cntr.start(&Taskinfo::command(["true"])).unwrap();
        cntr.wait().unwrap();
        assert!(task_ids(&cntr).is_empty());
        assert!(cntr.attach(&id).err().unwrap().is_not_found());
    }

    #[test]
    fn attach_round_trips_through_cat() {
        let cntr = cntr();
        let id = cntr.start(&Taskinfo::command(["cat"])).unwrap();
        assert_eq!(task_ids(&cntr), vec![id.clone()]);
        let mut attacher = cntr.attach(&id).unwrap();
        attacher.write_all(b"ping").unwrap();
        attacher.close_write().unwrap();
        let mut out = String::new();
        let _ = attacher.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
        cntr.wait().unwrap();
    }

    #[test]
    fn environment_gets_defaults_and_terminal_size() {
        let cntr = cntr();
        let task = Taskinfo {
            env: vec!["GREETING=hi".into()],
            term_height: 24,
            term_width: 80,
            ..Taskinfo::command(["sh", "-c", "echo $GREETING $LINES $COLUMNS ${PATH:+path}"])
        };
        let id = cntr.start(&task).unwrap();
        let mut attacher = cntr.attach(&id).unwrap();
        let mut out = String::new();
        let _ = attacher.read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "hi 24 80 path");
        cntr.wait().unwrap();
    }

    #[test]
    fn malformed_environment_is_rejected() {
        let cntr = cntr();
        let task = Taskinfo {
            env: vec!["NOEQUALS".into()],
            ..Taskinfo::command(["true"])
        };
        assert!(matches!(
            cntr.start(&task),
            Err(BurrowError::InvalidArgument { .. })
        ));
        assert!(matches!(
            cntr.start(&Taskinfo::default()),
            Err(BurrowError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn stop_unknown_task_succeeds() {
        let cntr = cntr();
        cntr.stop("999999", true).unwrap();
        cntr.stop_all(false).unwrap();
    }

    #[test]
    fn stop_all_ends_every_task() {
        let cntr = cntr();
        let _ = cntr.start(&Taskinfo::command(["sleep", "30"])).unwrap();
        let _ = cntr.start(&Taskinfo::command(["sleep", "30"])).unwrap();
        assert_eq!(task_ids(&cntr).len(), 2);
        cntr.stop_all(true).unwrap();
        cntr.wait().unwrap();
        assert!(task_ids(&cntr).is_empty());
    }

    #[test]
    fn stop_returns_while_a_write_is_blocked() {
        let cntr = Arc::new(cntr());
        let id = cntr
            .start(&Taskinfo::command(["sh", "-c", "trap '' TERM; sleep 5"]))
            .unwrap();
        let mut attacher = cntr.attach(&id).unwrap();
        let writer = std::thread::spawn(move || attacher.write_all(&vec![0_u8; 1 << 20]));
        std::thread::sleep(Duration::from_millis(200));

        let (tx, rx) = mpsc::channel();
        let stopper = {
            let cntr = Arc::clone(&cntr);
            let id = id.clone();
            std::thread::spawn(move || {
                let _ = tx.send(cntr.stop(&id, false));
            })
        };
        rx.recv_timeout(Duration::from_secs(3))
            .expect("stop returned")
            .unwrap();
        stopper.join().unwrap();
        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        cntr.stop(&id, true).unwrap();
        cntr.wait().unwrap();
    }

    #[test]
    fn abandoned_task_is_killed_and_reaped() {
        let cntr = cntr();
        let process = cntr.process_spec(&Taskinfo::command(["sleep", "30"]), None).unwrap();
        let (task, child) = Task::spawn(cntr.runtime.as_ref(), &process).unwrap();
        let task = Arc::new(task);
        let _ = cntr.shared.tasks().insert(task.id(), Arc::clone(&task));
        *relock(cntr.shared.pending.lock()) += 1;
        drop(child);

        cntr.shared.abandon(&task);
        assert!(task_ids(&cntr).is_empty());
        cntr.wait().unwrap();
        let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(task.pid()), None);
        assert_eq!(gone, Err(nix::errno::Errno::ESRCH));
    }

    #[test]
    fn wait_after_start_waits_for_the_new_task() {
        let cntr = cntr();
        let id = cntr.start(&Taskinfo::command(["sleep", "0.2"])).unwrap();
        cntr.wait().unwrap();
        assert!(task_ids(&cntr).is_empty());
        assert!(cntr.attach(&id).err().unwrap().is_not_found());
    }

    #[test]
    fn task_rlimits_override_template() {
        let template = vec![
            Rlimit {
                kind: "RLIMIT_NOFILE".into(),
                soft: 64,
                hard: 64,
            },
            Rlimit {
                kind: "RLIMIT_CORE".into(),
                soft: 0,
                hard: 0,
            },
        ];
        let task = vec![Rlimit {
            kind: "RLIMIT_NOFILE".into(),
            soft: 128,
            hard: 256,
        }];
        let merged = merge_rlimits(&template, &task);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|l| l.kind == "RLIMIT_NOFILE" && l.soft == 128));
    }
}
