use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use refinery_core::config::{ExecutionMode, ExecutorConfig};
use refinery_core::error::{RefineryError, Result};

use super::builder::{Graph, Step};
use super::edge::{Next, Target};
use super::node::Node;
use crate::state::{Partial, WorkflowState, FAILED_STEP};

/// One node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRun {
    pub node: String,
    pub elapsed_ms: u64,
    /// The node reported failure (or panicked).
    pub failed: bool,
}

/// Outcome of a graph run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Final state.
    pub state: WorkflowState,
    /// Node executions in the order their updates were applied.
    pub trace: Vec<NodeRun>,
    /// Composition of every applied update.
    pub changes: Partial,
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    /// How many times `node` executed.
    pub fn runs_of(&self, node: &str) -> usize {
        self.trace.iter().filter(|r| r.node == node).count()
    }
}

/// A run stopped by an error, with the updates applied before it stopped.
#[derive(Debug)]
pub struct Aborted {
    pub error: RefineryError,
    pub changes: Partial,
}

/// Walks a compiled graph one step at a time.
///
/// Starting at the entry node, each step runs against the current state,
/// its update is merged, and the outgoing transition picks the next step.
/// The run ends at END, at a node without an outgoing edge, or when a
/// router answers an unregistered label.
pub struct Executor {
    mode: ExecutionMode,
    max_steps: usize,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            mode: config.mode,
            max_steps: config.max_steps,
        }
    }

    /// Run `graph` from its entry node.
    ///
    /// The only runtime error is `StepLimitExceeded`; everything else is
    /// rejected when the graph compiles. A `Done` state is returned as is.
    pub async fn run(&self, graph: &Graph, state: WorkflowState) -> Result<ExecutionResult> {
        self.run_tracked(graph, state).await.map_err(|aborted| aborted.error)
    }

    /// Like `run`, but an aborted run still reports what it applied.
    pub async fn run_tracked(
        &self,
        graph: &Graph,
        state: WorkflowState,
    ) -> std::result::Result<ExecutionResult, Aborted> {
        let start = Instant::now();
        let mut state = state;
        let mut trace = Vec::new();
        let mut changes = Partial::new();

        if state.is_done() {
            debug!(graph = %graph.name, "State already done, nothing to run");
            return Ok(ExecutionResult {
                state,
                trace,
                changes,
                total_elapsed_ms: 0,
            });
        }

        let run_id = uuid::Uuid::new_v4();
        info!(graph = %graph.name, %run_id, entry = %graph.entry, "Starting graph run");

        let mut current = graph.entry.clone();
        loop {
            let Some(step) = graph.steps.get(&current) else {
                // compile() guarantees every target exists
                return Err(Aborted {
                    error: RefineryError::Graph(format!("node '{}' not found", current)),
                    changes,
                });
            };

            let members = step.members().len();
            if trace.len() + members > self.max_steps {
                warn!(graph = %graph.name, %run_id, max_steps = self.max_steps, "Step limit exceeded");
                return Err(Aborted {
                    error: RefineryError::StepLimitExceeded(self.max_steps),
                    changes,
                });
            }

            let results = match (step, self.mode) {
                (Step::Group(nodes), ExecutionMode::FanOut) => fan_out(nodes, &state).await,
                (Step::Group(nodes), ExecutionMode::Sequential) => {
                    // Each member sees its predecessors' output.
                    for node in nodes {
                        let (run, partial) = execute(node.as_ref(), &state).await;
                        commit(&mut state, &mut changes, &mut trace, run, partial);
                    }
                    vec![]
                }
                (Step::Single(node), _) => vec![execute(node.as_ref(), &state).await],
            };
            for (run, partial) in results {
                commit(&mut state, &mut changes, &mut trace, run, partial);
            }

            let next = match graph.transitions.get(&current) {
                None => {
                    debug!(node = %current, "No outgoing edge, graph complete");
                    break;
                }
                Some(transition) => transition.next(&state),
            };

            match next {
                Next::Go(Target::End) => break,
                Next::Go(Target::Node(name)) => current = name.clone(),
                Next::Unrouted(label) => {
                    warn!(node = %current, label = %label, "Router returned an unregistered label, stopping");
                    let halt = Partial::new().halt(&graph.schema, &current);
                    changes.absorb(&graph.schema, halt.clone());
                    state.apply(halt);
                    break;
                }
            }
        }

        state.mark_done();
        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            graph = %graph.name,
            %run_id,
            steps = trace.len(),
            total_elapsed_ms,
            "Graph run complete"
        );

        Ok(ExecutionResult {
            state,
            trace,
            changes,
            total_elapsed_ms,
        })
    }
}

/// Run `graph` with its own executor settings and return the final state.
pub async fn invoke(graph: &Graph, state: WorkflowState) -> Result<WorkflowState> {
    Ok(Executor::new(&graph.config).run(graph, state).await?.state)
}

fn commit(
    state: &mut WorkflowState,
    changes: &mut Partial,
    trace: &mut Vec<NodeRun>,
    run: NodeRun,
    partial: Partial,
) {
    changes.absorb(state.schema(), partial.clone());
    state.apply(partial);
    trace.push(run);
}

/// Run one node, converting a panic into a failure update.
async fn execute(node: &dyn Node, state: &WorkflowState) -> (NodeRun, Partial) {
    let name = node.name().to_string();
    info!(node = %name, "Executing graph node");
    let started = Instant::now();

    let outcome = AssertUnwindSafe(async { node.run(state).await })
        .catch_unwind()
        .await;

    let (partial, panicked) = match outcome {
        Ok(partial) => (partial, false),
        Err(panic) => {
            let message = panic_message(&panic);
            error!(node = %name, error = %message, "Graph node panicked");
            let partial = match node.outputs().first() {
                Some(field) => Partial::failure(
                    state.schema(),
                    &name,
                    field,
                    &format!("Error in {}: {}", name, message),
                ),
                None => Partial::new().halt(state.schema(), &name),
            };
            (partial, true)
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let failed = panicked || partial.get(FAILED_STEP).and_then(|v| v.as_str()) == Some(name.as_str());
    debug!(node = %name, failed, elapsed_ms, "Node execution complete");

    (
        NodeRun {
            node: name,
            elapsed_ms,
            failed,
        },
        partial,
    )
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "node panicked".to_string()
    }
}

/// Run group members concurrently on one snapshot.
///
/// Results arrive over a channel in completion order; this single reducer
/// releases them in declared order so merges stay deterministic.
async fn fan_out(nodes: &[Arc<dyn Node>], state: &WorkflowState) -> Vec<(NodeRun, Partial)> {
    let snapshot = Arc::new(state.clone());
    let (tx, mut rx) = mpsc::channel(nodes.len().max(1));

    for (index, node) in nodes.iter().enumerate() {
        let tx = tx.clone();
        let node = Arc::clone(node);
        let snapshot = Arc::clone(&snapshot);
        tokio::spawn(async move {
            let result = execute(node.as_ref(), &snapshot).await;
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let mut pending = BTreeMap::new();
    let mut ordered = Vec::with_capacity(nodes.len());
    while let Some((index, result)) = rx.recv().await {
        pending.insert(index, result);
        while let Some(result) = pending.remove(&ordered.len()) {
            ordered.push(result);
        }
    }

    if ordered.len() < nodes.len() {
        warn!(
            expected = nodes.len(),
            received = ordered.len(),
            "Fan-out member did not report, later results dropped"
        );
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;
    use crate::graph::edge::END;
    use crate::graph::node::FnNode;
    use crate::state::{MergePolicy, StateSchema, SHOULD_CONTINUE};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn schema() -> Arc<StateSchema> {
        Arc::new(
            StateSchema::new()
                .field("count", MergePolicy::Overwrite, "")
                .field("answers", MergePolicy::ListAppend, "")
                .field("field", MergePolicy::DictUnion, "")
                .with_halt_fields(),
        )
    }

    fn count_of(s: &WorkflowState) -> i64 {
        s.get("count").and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// A --always--> B --router("continue"->A, "stop"->END)
    fn loop_graph(answers: Vec<&'static str>) -> Graph {
        let mut b = GraphBuilder::new("loop", schema());
        b.register_fn("a", &["count"], |s| Partial::new().set("count", count_of(s) + 1));
        b.register_fn("b", &["answers"], |s| {
            Partial::new().set("answers", format!("b saw {}", count_of(s)))
        });
        let calls = AtomicUsize::new(0);
        b.register_edge("a", "b")
            .register_conditional_edge(
                "b",
                move |_| {
                    let i = calls.fetch_add(1, Ordering::SeqCst);
                    answers.get(i).copied().unwrap_or("stop").to_string()
                },
                [("continue", "a"), ("stop", END)],
            )
            .set_entry("a");
        b.compile().unwrap()
    }

    #[tokio::test]
    async fn test_loop_scenario() {
        let g = loop_graph(vec!["continue", "continue", "stop"]);
        let result = g.invoke(g.new_state(Partial::new())).await.unwrap();

        assert_eq!(result.runs_of("a"), 3);
        assert_eq!(result.runs_of("b"), 3);
        assert_eq!(result.trace.len(), 6);
        assert_eq!(count_of(&result.state), 3);
        assert_eq!(
            result.state.get("answers"),
            Some(&json!(["b saw 1", "b saw 2", "b saw 3"]))
        );
        assert!(result.state.is_done());
    }

    #[tokio::test]
    async fn test_done_state_is_idempotent() {
        let g = loop_graph(vec!["stop"]);
        let first = g.invoke(g.new_state(Partial::new())).await.unwrap();
        assert_eq!(first.trace.len(), 2);

        let second = g.invoke(first.state.clone()).await.unwrap();
        assert!(second.trace.is_empty());
        assert_eq!(second.state, first.state);
    }

    #[tokio::test]
    async fn test_panicking_node_does_not_crash_invoke() {
        let mut b = GraphBuilder::new("g", schema());
        b.register_fn("flaky", &["field"], |_| panic!("connection reset"));
        b.register_fn("after", &["count"], |_| Partial::new().set("count", 1));
        b.register_edge("flaky", "after").set_entry("flaky");
        let g = b.compile().unwrap();

        let result = g.invoke(g.new_state(Partial::new())).await.unwrap();
        let state = &result.state;
        let msg = state.entry_str("field", "flaky").unwrap();
        assert!(msg.contains("connection reset"));
        assert_eq!(state.get_bool(SHOULD_CONTINUE), Some(false));
        assert_eq!(state.get_str(FAILED_STEP), Some("flaky"));
        assert!(result.trace[0].failed);
        // the run carries on past the failed node
        assert_eq!(count_of(state), 1);
    }

    #[tokio::test]
    async fn test_node_without_edge_ends_run() {
        let mut b = GraphBuilder::new("g", schema());
        b.register_fn("only", &["count"], |_| Partial::new().set("count", 9));
        b.set_entry("only");
        let g = b.compile().unwrap();
        let state = invoke(&g, g.new_state(Partial::new())).await.unwrap();
        assert_eq!(count_of(&state), 9);
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn test_unrouted_label_stops_with_marker() {
        let mut b = GraphBuilder::new("g", schema());
        b.register_fn("a", &["count"], |_| Partial::new().set("count", 1));
        b.register_conditional_edge("a", |_| "sideways".to_string(), [("stop", END)])
            .set_entry("a");
        let g = b.compile().unwrap();
        let state = invoke(&g, g.new_state(Partial::new())).await.unwrap();
        assert_eq!(state.get_str(FAILED_STEP), Some("a"));
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn test_step_limit() {
        let mut b = GraphBuilder::new("spin", schema());
        b.register_fn("a", &["count"], |s| Partial::new().set("count", count_of(s) + 1));
        b.register_edge("a", "a")
            .set_entry("a")
            .set_executor(ExecutorConfig {
                mode: ExecutionMode::Sequential,
                max_steps: 5,
            });
        let g = b.compile().unwrap();
        let err = g.invoke(g.new_state(Partial::new())).await.unwrap_err();
        assert!(matches!(err, RefineryError::StepLimitExceeded(5)));
    }

    #[tokio::test]
    async fn test_aborted_run_keeps_applied_changes() {
        let mut b = GraphBuilder::new("spin", schema());
        b.register_fn("a", &["answers"], |_| Partial::new().set("answers", "a"));
        b.register_edge("a", "a")
            .set_entry("a")
            .set_executor(ExecutorConfig {
                mode: ExecutionMode::Sequential,
                max_steps: 2,
            });
        let g = b.compile().unwrap();
        let aborted = Executor::new(g.executor_config())
            .run_tracked(&g, g.new_state(Partial::new()))
            .await
            .unwrap_err();
        assert!(matches!(aborted.error, RefineryError::StepLimitExceeded(2)));
        assert_eq!(aborted.changes.get("answers"), Some(&json!(["a", "a"])));
    }

    fn sibling(name: &'static str, value: &'static str) -> Arc<dyn Node> {
        Arc::new(FnNode::new(name, &["field"], move |_| {
            Partial::new().entry("field", name, value)
        }))
    }

    fn sibling_graph(mode: ExecutionMode, members: Vec<Arc<dyn Node>>) -> Graph {
        let mut b = GraphBuilder::new("siblings", schema());
        b.register_group("panel", members)
            .register_edge("panel", END)
            .set_entry("panel")
            .set_executor(ExecutorConfig {
                mode,
                max_steps: 100,
            });
        b.compile().unwrap()
    }

    #[tokio::test]
    async fn test_sequential_siblings_union() {
        let g = sibling_graph(
            ExecutionMode::Sequential,
            vec![sibling("x", "vx"), sibling("y", "vy")],
        );
        let state = invoke(&g, g.new_state(Partial::new())).await.unwrap();
        assert_eq!(state.get("field"), Some(&json!({"x": "vx", "y": "vy"})));
    }

    struct Slow {
        name: &'static str,
        delay_ms: u64,
        key: &'static str,
    }

    impl Node for Slow {
        fn name(&self) -> &str {
            self.name
        }

        fn outputs(&self) -> Vec<String> {
            vec!["field".into()]
        }

        fn run<'a>(&'a self, _state: &'a WorkflowState) -> futures::future::BoxFuture<'a, Partial> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                Partial::new().entry("field", self.key, self.name)
            })
        }
    }

    #[tokio::test]
    async fn test_fan_out_matches_sequential() {
        let members = || -> Vec<Arc<dyn Node>> { vec![sibling("x", "vx"), sibling("y", "vy")] };
        let seq = sibling_graph(ExecutionMode::Sequential, members());
        let par = sibling_graph(ExecutionMode::FanOut, members());

        let a = invoke(&seq, seq.new_state(Partial::new())).await.unwrap();
        let b = invoke(&par, par.new_state(Partial::new())).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_fan_out_overlap_uses_declared_order() {
        // The first member finishes last; declared order still decides the winner.
        let g = sibling_graph(
            ExecutionMode::FanOut,
            vec![
                Arc::new(Slow { name: "first", delay_ms: 40, key: "k" }),
                Arc::new(Slow { name: "second", delay_ms: 0, key: "k" }),
            ],
        );
        let result = g.invoke(g.new_state(Partial::new())).await.unwrap();
        assert_eq!(result.state.get("field"), Some(&json!({"k": "second"})));
        let order: Vec<&str> = result.trace.iter().map(|r| r.node.as_str()).collect();
        assert_eq!(order, ["first", "second"]);
    }

    #[tokio::test]
    async fn test_changes_compose_all_updates() {
        let g = loop_graph(vec!["continue", "stop"]);
        let initial = g.new_state(Partial::new().set("answers", json!(["seed"])));
        let result = g.invoke(initial.clone()).await.unwrap();

        let mut replay = initial;
        replay.apply(result.changes.clone());
        assert_eq!(replay.values(), result.state.values());
    }
}
