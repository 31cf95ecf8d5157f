//! Background execution: live status, blocking wait, and cooperative
//! cancellation.

use pipeflow::prelude::*;
use serde_json::{json, Value};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::tempdir;

/// A chain of `len` nodes, each sleeping `delay` and bumping a counter.
fn sleepy_chain(len: usize, delay: Duration) -> Node {
    let make = |i: usize| {
        Node::new(FunctionNode::new(
            format!("Step{i}"),
            |store: &Store| Ok(store.get("count").unwrap_or(json!(0))),
            move |count: Value| {
                std::thread::sleep(delay);
                Ok(json!(count.as_i64().unwrap_or(0) + 1))
            },
            |store: &mut Store, _prep: &Value, out: Value| {
                store.set("count", out)?;
                Ok(Action::new("next"))
            },
        ))
    };

    let head = make(0);
    let mut tail = head.clone();
    for i in 1..len {
        let node = make(i);
        tail.then("next", &node);
        tail = node;
    }
    head
}

#[test]
fn test_background_cancel_mid_flow() {
    let dir = tempdir().unwrap();
    let flow = Flow::builder(sleepy_chain(10, Duration::from_millis(100)))
        .flow_name("cancellable")
        .db_path(dir.path().join("runs.db"))
        .build()
        .unwrap();

    let handle = flow.run_background(Store::new("bg")).unwrap();
    std::thread::sleep(Duration::from_millis(250));
    handle.cancel();

    // The node in flight when the flag flipped runs to completion, so the
    // wait resolves within roughly one node duration.
    let waited = Instant::now();
    let store = handle.wait(None).expect("cancelled runs return the store");
    assert!(waited.elapsed() < Duration::from_millis(500));

    assert_eq!(handle.status(), RunStatus::Cancelled);

    // Checkpoints exist for completed steps only, and the partial store
    // matches the last one.
    let db = flow.db().unwrap();
    let checkpoints = db.get_checkpoints(handle.run_id()).unwrap();
    let completed = checkpoints.len() as i64;
    assert!(completed >= 1 && completed < 10, "completed {completed}");
    assert_eq!(store.get("count").unwrap(), json!(completed));

    let events = db.get_events(handle.run_id()).unwrap();
    assert_eq!(events.last().unwrap().event, "flow_cancel");
}

#[test]
fn test_cancel_before_first_node_leaves_no_checkpoints() {
    let dir = tempdir().unwrap();
    let flow = Flow::builder(sleepy_chain(3, Duration::from_millis(10)))
        .flow_name("early-cancel")
        .db_path(dir.path().join("runs.db"))
        .build()
        .unwrap();

    // Gate the worker inside the flow_start hook so the cancel flag is
    // guaranteed to be set before the first node starts.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    flow.on("flow_start", move |_| {
        release_rx.lock().unwrap().recv().unwrap();
    })
    .unwrap();

    let handle = flow.run_background(Store::new("bg")).unwrap();
    handle.cancel();
    release_tx.send(()).unwrap();

    let store = handle.wait(None).expect("cancelled runs return the store");
    assert_eq!(handle.status(), RunStatus::Cancelled);
    assert!(!store.contains("count"));

    let db = flow.db().unwrap();
    assert!(db.get_checkpoints(handle.run_id()).unwrap().is_empty());
    let events = db.get_events(handle.run_id()).unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(names, vec!["flow_start", "flow_cancel"]);
}

#[test]
fn test_status_is_live_while_running() {
    let dir = tempdir().unwrap();
    let flow = Flow::builder(sleepy_chain(4, Duration::from_millis(50)))
        .flow_name("live-status")
        .db_path(dir.path().join("runs.db"))
        .build()
        .unwrap();

    let handle = flow.run_background(Store::new("bg")).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(handle.status(), RunStatus::Running);

    handle.wait(None).unwrap();
    assert_eq!(handle.status(), RunStatus::Completed);

    // The monitor's view through a separate handle agrees.
    let db = WorkflowDB::open(dir.path().join("runs.db")).unwrap();
    let run = db.get_run(handle.run_id()).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_steps, 4);
}

#[test]
fn test_multiple_handles_coexist() {
    let flow = Flow::new(sleepy_chain(2, Duration::from_millis(30))).unwrap();

    let first = flow.run_background(Store::new("one")).unwrap();
    let second = flow.run_background(Store::new("two")).unwrap();
    assert_ne!(first.run_id(), second.run_id());

    let a = first.wait(None).unwrap();
    let b = second.wait(None).unwrap();
    assert_eq!(a.get("count").unwrap(), json!(2));
    assert_eq!(b.get("count").unwrap(), json!(2));
}

#[test]
fn test_async_fan_out_inside_one_node() {
    struct FanOut;
    #[async_trait::async_trait]
    impl AsyncNodeBackend for FanOut {
        async fn exec_async(&self, _prep: Value) -> Result<Value, BoxError> {
            let tasks = (1..=4).map(|i| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    i * i
                })
            });
            let mut squares = Vec::new();
            for task in tasks {
                squares.push(task.await?);
            }
            Ok(json!(squares))
        }

        fn post(
            &self,
            store: &mut Store,
            _prep: &Value,
            exec_value: Value,
        ) -> Result<Action, BoxError> {
            store.set("squares", exec_value)?;
            Ok(Action::new("done"))
        }
    }

    let flow = Flow::new(Node::new_async(FanOut)).unwrap();
    let handle = flow.run_background(Store::new("fan")).unwrap();
    let store = handle.wait(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(store.get("squares").unwrap(), json!([1, 4, 9, 16]));
}
