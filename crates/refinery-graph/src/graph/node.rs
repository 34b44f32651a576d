use futures::future::BoxFuture;

use crate::state::{Partial, WorkflowState};

/// A unit of work in a graph.
///
/// `run` reads a snapshot and returns an update; it never mutates the
/// snapshot. Failures are reported inside the update (an error description
/// on the node's own output field), so the return type has no error channel.
pub trait Node: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// State fields this node reads.
    fn inputs(&self) -> Vec<String> {
        vec![]
    }

    /// State fields this node may write.
    fn outputs(&self) -> Vec<String>;

    /// Nested graphs expose their schema so the parent can check policies.
    fn schema(&self) -> Option<&crate::state::StateSchema> {
        None
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial>;
}

type NodeFn = dyn Fn(&WorkflowState) -> Partial + Send + Sync;

/// A node backed by a synchronous closure.
pub struct FnNode {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    body: Box<NodeFn>,
}

impl FnNode {
    pub fn new(
        name: impl Into<String>,
        outputs: &[&str],
        body: impl Fn(&WorkflowState) -> Partial + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: vec![],
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl Node for FnNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        let partial = (self.body)(state);
        Box::pin(async move { partial })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePolicy, StateSchema};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_node_runs_closure() {
        let schema = Arc::new(StateSchema::new().field("n", MergePolicy::Overwrite, ""));
        let node = FnNode::new("inc", &["n"], |s| {
            let n = s.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Partial::new().set("n", n + 1)
        })
        .with_inputs(&["n"]);

        let state = WorkflowState::with_input(schema, Partial::new().set("n", 41));
        let p = node.run(&state).await;
        assert_eq!(p.get("n"), Some(&serde_json::json!(42)));
        assert_eq!(state.get("n"), Some(&serde_json::json!(41)));
        assert_eq!(node.inputs(), vec!["n"]);
        assert_eq!(node.outputs(), vec!["n"]);
    }
}
