//! Integration tests for real out-of-process execution
//!
//! These tests fork the test process, so they run one at a time.
//! - Large array hand-off through backing regions
//! - Failure codes and crashes inside the child
//! - Killing a running child

#![cfg(unix)]

mod common;

use common::builders::{array_node, basic_node, gradient, kwargs_val};
use common::{run_once, shared_config, shm_files, test_timeout};
use nodexec::task::ForkSpawner;
use nodexec::{ElementType, ExecutionCoordinator, IsolationMode, NodeHandle, NotificationKind, Phase, Value};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fork_coordinator(node: &dyn NodeHandle, root: &std::path::Path) -> ExecutionCoordinator {
    ExecutionCoordinator::new(node, shared_config(root), Arc::new(ForkSpawner))
}

#[test]
#[serial]
fn test_large_float_array_from_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = array_node(1, IsolationMode::Process, vec![4000, 4000]);
    let mut coord = fork_coordinator(&node, dir.path());

    let notification = run_once(&mut coord, &mut node);
    assert_eq!(notification.kind, NotificationKind::Finished { return_code: 0 });
    assert_eq!(coord.return_code(), Some(0));

    let out = node.output("out").and_then(Value::as_array).unwrap();
    assert_eq!(out.shape(), &[4000, 4000]);
    assert_eq!(out.element_type(), ElementType::F32);
    assert!(out.is_mapped());
    assert!(out == &gradient(&[4000, 4000]));
    assert!(shm_files(dir.path()).is_empty());
}

#[test]
#[serial]
fn test_child_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = basic_node(2, IsolationMode::Process).with_compute(|ctx| {
        ctx.set_data("out", 1)?;
        anyhow::bail!("bad parameters")
    });
    let mut coord = fork_coordinator(&node, dir.path());

    assert_eq!(run_once(&mut coord, &mut node).return_code(), Some(-1));
    assert_eq!(node.output("out"), Some(&Value::Int(1)));
}

#[test]
#[serial]
fn test_child_widget_changes_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = basic_node(3, IsolationMode::Process).with_compute(|ctx| {
        ctx.modify_widget("a", kwargs_val(1))?;
        ctx.modify_widget("a", kwargs_val(2))?;
        ctx.set_requeue(true)?;
        Ok(0)
    });
    let mut coord = fork_coordinator(&node, dir.path());

    assert_eq!(run_once(&mut coord, &mut node).return_code(), Some(0));
    assert_eq!(node.widget_log().len(), 2);
    assert_eq!(node.widget_value("a"), Some(&Value::Int(2)));
    assert!(node.requeue_requested());
}

#[test]
#[serial]
fn test_child_crash_is_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = basic_node(4, IsolationMode::Process).with_compute(|ctx| {
        ctx.set_data("out", "never replayed")?;
        std::process::abort()
    });
    let mut coord = fork_coordinator(&node, dir.path());

    let notification = run_once(&mut coord, &mut node);
    assert_eq!(notification.kind, NotificationKind::Terminated);
    assert_eq!(coord.phase(), Phase::Terminated);
    assert!(node.output("out").is_none());
}

#[test]
#[serial]
fn test_terminate_kills_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = basic_node(5, IsolationMode::Process).with_compute(|_| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(0)
    });
    let mut coord = fork_coordinator(&node, dir.path());

    coord.start(&mut node).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(coord.is_running());

    let started = Instant::now();
    let notification = coord.terminate().expect("terminate should notify");
    assert_eq!(notification.kind, NotificationKind::Terminated);
    assert!(started.elapsed() < test_timeout());
    assert!(!coord.is_running());
}
