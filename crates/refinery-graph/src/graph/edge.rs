use std::collections::HashMap;
use std::sync::Arc;

use crate::state::WorkflowState;

/// Terminal sentinel usable wherever a target node name is expected.
pub const END: &str = "__end__";

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        if name == END {
            Target::End
        } else {
            Target::Node(name.to_string())
        }
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::from(name.as_str())
    }
}

/// Picks a label from the post-merge state. Must be pure.
pub type Router = Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>;

/// Outgoing transition of a step.
#[derive(Clone)]
pub enum Transition {
    /// Always move to the target.
    Always(Target),
    /// Ask the router for a label and move to the target registered under it.
    Conditional {
        router: Router,
        labels: HashMap<String, Target>,
    },
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Always(t) => f.debug_tuple("Always").field(t).finish(),
            Transition::Conditional { labels, .. } => f
                .debug_struct("Conditional")
                .field("labels", labels)
                .finish_non_exhaustive(),
        }
    }
}

impl Transition {
    /// Every target this transition can reach.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Transition::Always(t) => vec![t],
            Transition::Conditional { labels, .. } => labels.values().collect(),
        }
    }
}

/// Result of evaluating a transition.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Next<'a> {
    Go(&'a Target),
    /// The router answered a label with no registered target.
    Unrouted(String),
}

impl Transition {
    pub(crate) fn next(&self, state: &WorkflowState) -> Next<'_> {
        match self {
            Transition::Always(t) => Next::Go(t),
            Transition::Conditional { router, labels } => {
                let label = router(state);
                match labels.get(&label) {
                    Some(t) => Next::Go(t),
                    None => Next::Unrouted(label),
                }
            }
        }
    }
}
