//! End-to-end behavior of the local runtime.
//!
//! Tests against the namespace backend need unprivileged user namespaces
//! and are ignored by default; run them with `--ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use burrow_common::meta::Metainfo;
use burrow_common::types::{CntrSpec, Taskinfo};
use burrow_runtime::{Attacher, Cntr, CntrManager, HostRuntime, Manager, ManagerOptions, NamespaceRuntime, Runtime};
use burrow_store::{JsonStore, Store};

fn manager(runtime: Box<dyn Runtime>, data: &Path) -> CntrManager {
    let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
    CntrManager::open(
        store,
        runtime,
        ManagerOptions {
            data_dir: data.to_path_buf(),
            rootless: true,
        },
    )
    .expect("open manager")
}

fn output(mut attacher: Box<dyn Attacher>) -> String {
    let mut out = String::new();
    let _ = attacher.read_to_string(&mut out).expect("read output");
    out
}

/// Runs `script` once the caller is attached, so short-lived tasks cannot
/// exit before their output is read.
fn gated(script: &str) -> Taskinfo {
    Taskinfo::command(["sh", "-c", &format!("read _ ; {script}")])
}

fn release(cntr: &dyn Cntr, task: &str) -> String {
    let mut attacher = cntr.attach(task).expect("attach");
    attacher.write_all(b"\n").expect("release");
    output(attacher)
}

#[test]
fn tasks_run_side_by_side_and_are_reaped() {
    let data = tempfile::tempdir().expect("tempdir");
    let manager = manager(Box::new(HostRuntime::new()), data.path());
    let id = manager
        .create(&CntrSpec {
            rootfs: "/".into(),
            ..CntrSpec::default()
        })
        .unwrap();
    let cntr = manager.get(&id).unwrap();

    let long = cntr.start(&Taskinfo::command(["sleep", "30"])).unwrap();
    let short = cntr.start(&gated("echo joined")).unwrap();
    assert_ne!(long, short);
    assert_eq!(release(cntr.as_ref(), &short), "joined\n");

    cntr.stop(&long, false).unwrap();
    cntr.wait().unwrap();
    let mut live = Vec::new();
    cntr.list(&mut |task| {
        live.push(task.to_string());
        Ok(())
    })
    .unwrap();
    assert!(live.is_empty());
    manager.close().unwrap();
}

#[test]
fn task_working_directory_is_inside_rootfs() {
    let data = tempfile::tempdir().expect("tempdir");
    let rootfs = data.path().join("rootfs").join("box");
    std::fs::create_dir_all(rootfs.join("work")).unwrap();
    let manager = manager(Box::new(HostRuntime::new()), data.path());
    let id = manager
        .create(&CntrSpec {
            rootfs: "box".into(),
            ..CntrSpec::default()
        })
        .unwrap();
    let cntr = manager.get(&id).unwrap();
    let task = cntr
        .start(&Taskinfo {
            cwd: Some("/work".into()),
            ..gated("pwd -P")
        })
        .unwrap();
    let printed = release(cntr.as_ref(), &task);
    assert_eq!(Path::new(printed.trim()), rootfs.join("work").canonicalize().unwrap());
    manager.close().unwrap();
}

#[test]
#[ignore = "needs unprivileged user namespaces"]
fn namespace_tasks_share_hostname() {
    let data = tempfile::tempdir().expect("tempdir");
    let cgroups = tempfile::tempdir().expect("tempdir");
    let manager = manager(Box::new(NamespaceRuntime::new(cgroups.path())), data.path());
    let id = manager
        .create(&CntrSpec {
            rootfs: "/".into(),
            meta: Metainfo {
                name: "burrowed".into(),
                ..Metainfo::default()
            },
            ..CntrSpec::default()
        })
        .unwrap();
    let cntr = manager.get(&id).unwrap();
    let init = cntr.start(&Taskinfo::command(["sleep", "30"])).unwrap();
    let joined = cntr.start(&gated("hostname")).unwrap();
    assert_eq!(release(cntr.as_ref(), &joined).trim(), "burrowed");
    cntr.stop(&init, true).unwrap();
    manager.delete(&id).unwrap();
}

#[test]
#[ignore = "needs unprivileged user namespaces"]
fn namespace_task_is_pid_one_of_its_namespace() {
    let data = tempfile::tempdir().expect("tempdir");
    let cgroups = tempfile::tempdir().expect("tempdir");
    let manager = manager(Box::new(NamespaceRuntime::new(cgroups.path())), data.path());
    let id = manager
        .create(&CntrSpec {
            rootfs: "/".into(),
            ..CntrSpec::default()
        })
        .unwrap();
    let cntr = manager.get(&id).unwrap();
    let task = cntr.start(&gated("echo $$")).unwrap();
    assert_eq!(release(cntr.as_ref(), &task).trim(), "1");
    manager.delete(&id).unwrap();
}
