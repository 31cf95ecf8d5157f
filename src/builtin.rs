//! # Built-in Nodes
//!
//! A small set of ready-made backends for common wiring: seeding values,
//! tracing progress, pacing a flow, and branching on store state. They
//! double as working examples of the two backend traits.

use crate::action::Action;
use crate::node::{AsyncNodeBackend, NodeBackend};
use crate::store::Store;
use crate::BoxError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Writes a fixed value under a key, then follows `action`.
pub struct SetValueNode {
    key: String,
    value: Value,
    action: Action,
}

impl SetValueNode {
    pub fn new(key: impl Into<String>, value: Value, action: Action) -> Self {
        SetValueNode {
            key: key.into(),
            value,
            action,
        }
    }
}

impl NodeBackend for SetValueNode {
    fn exec(&self, _prep: Value) -> Result<Value, BoxError> {
        Ok(self.value.clone())
    }

    fn post(&self, store: &mut Store, _prep: &Value, exec_value: Value) -> Result<Action, BoxError> {
        store.set(self.key.clone(), exec_value)?;
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "SetValueNode"
    }
}

/// Emits a `tracing` info line, then follows `action`. The store passes
/// through untouched.
pub struct LogNode {
    message: String,
    action: Action,
}

impl LogNode {
    pub fn new(message: impl Into<String>, action: Action) -> Self {
        LogNode {
            message: message.into(),
            action,
        }
    }
}

impl NodeBackend for LogNode {
    fn exec(&self, prep: Value) -> Result<Value, BoxError> {
        info!(message = %self.message, "log node");
        Ok(prep)
    }

    fn post(&self, _store: &mut Store, _prep: &Value, _exec: Value) -> Result<Action, BoxError> {
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "LogNode"
    }
}

/// Sleeps for a fixed duration, then follows `action`. Async so the delay
/// happens on the flow's runtime rather than blocking a scheduler thread
/// mid-phase.
pub struct DelayNode {
    delay: Duration,
    action: Action,
}

impl DelayNode {
    pub fn new(delay: Duration, action: Action) -> Self {
        DelayNode { delay, action }
    }
}

#[async_trait]
impl AsyncNodeBackend for DelayNode {
    async fn exec_async(&self, prep: Value) -> Result<Value, BoxError> {
        tokio::time::sleep(self.delay).await;
        Ok(prep)
    }

    fn post(&self, _store: &mut Store, _prep: &Value, _exec: Value) -> Result<Action, BoxError> {
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        "DelayNode"
    }
}

// Predicate over the current value of the inspected key (Null if absent).
type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Branches on a store key: follows `if_true` when the predicate holds for
/// the key's current value, `if_false` otherwise.
pub struct ConditionalNode {
    key: String,
    predicate: Predicate,
    if_true: Action,
    if_false: Action,
}

impl ConditionalNode {
    pub fn new<P>(key: impl Into<String>, predicate: P, if_true: Action, if_false: Action) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        ConditionalNode {
            key: key.into(),
            predicate: Box::new(predicate),
            if_true,
            if_false,
        }
    }
}

impl NodeBackend for ConditionalNode {
    fn prep(&self, store: &Store) -> Result<Value, BoxError> {
        Ok(store.get(&self.key).unwrap_or(Value::Null))
    }

    fn exec(&self, prep: Value) -> Result<Value, BoxError> {
        Ok(Value::Bool((self.predicate)(&prep)))
    }

    fn post(&self, _store: &mut Store, _prep: &Value, exec: Value) -> Result<Action, BoxError> {
        let taken = if exec.as_bool().unwrap_or(false) {
            self.if_true.clone()
        } else {
            self.if_false.clone()
        };
        Ok(taken)
    }

    fn name(&self) -> &str {
        "ConditionalNode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use crate::node::Node;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_set_value_node() {
        let set = Node::new(SetValueNode::new("k", json!("v"), Action::new("done")));
        let flow = Flow::new(set).unwrap();
        let store = flow.run(Store::new("s")).unwrap();
        assert_eq!(store.get("k").unwrap(), json!("v"));
    }

    #[test]
    fn test_conditional_node_branches() {
        let check = Node::new(ConditionalNode::new(
            "flag",
            |v| v.as_bool().unwrap_or(false),
            Action::new("yes"),
            Action::new("no"),
        ));
        let yes = Node::new(SetValueNode::new("took", json!("yes"), Action::new("end")));
        let no = Node::new(SetValueNode::new("took", json!("no"), Action::new("end")));
        check.then("yes", &yes).then("no", &no);

        let flow = Flow::new(check).unwrap();

        let mut store = Store::new("s");
        store.set("flag", json!(true)).unwrap();
        let store = flow.run(store).unwrap();
        assert_eq!(store.get("took").unwrap(), json!("yes"));

        // Absent key reads as null and takes the false branch.
        let store = flow.run(Store::new("s")).unwrap();
        assert_eq!(store.get("took").unwrap(), json!("no"));
    }

    #[test]
    fn test_delay_node_sleeps() {
        let delay = Node::new_async(DelayNode::new(
            Duration::from_millis(50),
            Action::new("done"),
        ));
        let flow = Flow::new(delay).unwrap();

        let begun = Instant::now();
        flow.run(Store::new("s")).unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_log_node_passes_through() {
        let log = Node::new(LogNode::new("hello", Action::new("next")));
        let sink = Node::new(SetValueNode::new("after", json!(true), Action::new("end")));
        log.then("next", &sink);

        let flow = Flow::new(log).unwrap();
        let store = flow.run(Store::new("s")).unwrap();
        assert_eq!(store.get("after").unwrap(), json!(true));
    }
}
