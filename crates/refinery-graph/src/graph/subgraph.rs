use std::collections::BTreeSet;

use futures::future::BoxFuture;
use tracing::warn;

use refinery_core::error::Result;

use super::builder::Graph;
use super::executor::{ExecutionResult, Executor};
use super::node::Node;
use crate::state::{Partial, StateSchema, WorkflowState};

impl Graph {
    /// Run this graph with its own executor settings.
    pub async fn invoke(&self, state: WorkflowState) -> Result<ExecutionResult> {
        Executor::new(&self.config).run(self, state).await
    }

    fn collect(&self, f: impl Fn(&dyn Node) -> Vec<String>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut fields = vec![];
        for name in &self.order {
            let Some(step) = self.steps.get(name) else { continue };
            for node in step.members() {
                for field in f(node.as_ref()) {
                    if seen.insert(field.clone()) {
                        fields.push(field);
                    }
                }
            }
        }
        fields
    }
}

/// A compiled graph is itself a node: it runs to completion on a copy of
/// the parent state and returns the composition of its updates, so merging
/// it equals running its nodes inline.
impl Node for Graph {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        self.collect(|n| n.inputs())
    }

    fn outputs(&self) -> Vec<String> {
        self.collect(|n| n.outputs())
    }

    fn schema(&self) -> Option<&StateSchema> {
        Some(&self.schema)
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let inner = state.project(self.schema.clone());
            match Executor::new(&self.config).run_tracked(self, inner).await {
                Ok(result) => result.changes,
                Err(aborted) => {
                    warn!(graph = %self.name, error = %aborted.error, "Nested graph aborted");
                    aborted.changes.halt(&self.schema, &self.name)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use refinery_core::config::{ExecutionMode, ExecutorConfig};
    use serde_json::json;

    use crate::graph::builder::GraphBuilder;
    use crate::graph::edge::END;
    use crate::graph::executor::invoke;
    use crate::state::{MergePolicy, Partial, StateSchema, FAILED_STEP};

    fn schema() -> Arc<StateSchema> {
        Arc::new(
            StateSchema::new()
                .field("notes", MergePolicy::DictUnion, "")
                .field("log", MergePolicy::ListAppend, "")
                .field("summary", MergePolicy::Overwrite, "")
                .with_halt_fields(),
        )
    }

    fn register_inner_nodes(b: &mut GraphBuilder) {
        b.register_fn("x", &["notes", "log"], |_| {
            Partial::new().entry("notes", "x", "from x").set("log", "x ran")
        });
        b.register_fn("y", &["notes", "log"], |s| {
            let seen = s.get("notes").map(|n| n.as_object().map_or(0, |m| m.len())).unwrap_or(0);
            Partial::new()
                .entry("notes", "y", format!("y saw {} notes", seen))
                .set("log", "y ran")
        });
    }

    fn register_summary(b: &mut GraphBuilder) {
        b.register_fn("summarize", &["summary"], |s| {
            Partial::new().set("summary", s.get("notes").cloned().unwrap_or_default())
        });
    }

    #[tokio::test]
    async fn test_nested_graph_equals_inline() {
        let input = || Partial::new().set("log", json!(["start"]));

        let mut inner = GraphBuilder::new("group", schema());
        register_inner_nodes(&mut inner);
        inner.register_edge("x", "y").set_entry("x");
        let inner = inner.compile().unwrap();

        let mut outer = GraphBuilder::new("outer", schema());
        outer.register_node(inner);
        register_summary(&mut outer);
        outer.register_edge("group", "summarize").set_entry("group");
        let outer = outer.compile().unwrap();

        let mut flat = GraphBuilder::new("flat", schema());
        register_inner_nodes(&mut flat);
        register_summary(&mut flat);
        flat.register_edge("x", "y")
            .register_edge("y", "summarize")
            .set_entry("x");
        let flat = flat.compile().unwrap();

        let nested = invoke(&outer, outer.new_state(input())).await.unwrap();
        let inline = invoke(&flat, flat.new_state(input())).await.unwrap();
        assert_eq!(nested, inline);
        assert_eq!(
            nested.get("log"),
            Some(&json!(["start", "x ran", "y ran"]))
        );
        assert_eq!(nested.entry_str("notes", "y"), Some("y saw 1 notes"));
    }

    #[tokio::test]
    async fn test_nested_graph_reruns_each_visit() {
        let mut inner = GraphBuilder::new("group", schema());
        inner.register_fn("tick", &["log"], |_| Partial::new().set("log", "tick"));
        inner.set_entry("tick");
        let inner = inner.compile().unwrap();

        let mut outer = GraphBuilder::new("outer", schema());
        outer.register_node(inner);
        outer
            .register_conditional_edge(
                "group",
                |s| {
                    let ticks = s.get("log").and_then(|l| l.as_array()).map_or(0, |l| l.len());
                    let label = if ticks < 3 { "again" } else { "done" };
                    label.to_string()
                },
                [("again", "group"), ("done", END)],
            )
            .set_entry("group");
        let outer = outer.compile().unwrap();

        let result = outer.invoke(outer.new_state(Partial::new())).await.unwrap();
        assert_eq!(result.state.get("log"), Some(&json!(["tick", "tick", "tick"])));
    }

    #[tokio::test]
    async fn test_policy_mismatch_rejected() {
        let other = Arc::new(StateSchema::new().field("notes", MergePolicy::Overwrite, ""));
        let mut inner = GraphBuilder::new("group", other);
        inner.register_fn("x", &["notes"], |_| Partial::new());
        inner.set_entry("x");
        let inner = inner.compile().unwrap();

        let mut outer = GraphBuilder::new("outer", schema());
        outer.register_node(inner).set_entry("group");
        assert!(outer.compile().is_err());
    }

    #[tokio::test]
    async fn test_nested_step_limit_becomes_halt() {
        let mut inner = GraphBuilder::new("spin", schema());
        inner.register_fn("a", &["log"], |_| Partial::new().set("log", "a"));
        inner.register_edge("a", "a").set_entry("a").set_executor(ExecutorConfig {
            mode: ExecutionMode::Sequential,
            max_steps: 3,
        });
        let inner = inner.compile().unwrap();

        let mut outer = GraphBuilder::new("outer", schema());
        outer.register_node(inner).set_entry("spin");
        let outer = outer.compile().unwrap();

        let state = invoke(&outer, outer.new_state(Partial::new())).await.unwrap();
        assert_eq!(state.get_str(FAILED_STEP), Some("spin"));
        // what ran before the limit is kept
        assert_eq!(state.get("log"), Some(&json!(["a", "a", "a"])));
    }
}
