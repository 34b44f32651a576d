use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use refinery_core::config::ExecutorConfig;
use refinery_core::error::{RefineryError, Result};

use super::edge::{Target, Transition};
use super::node::{FnNode, Node};
use crate::state::{Partial, StateSchema, WorkflowState};

/// What runs when the executor lands on a step.
#[derive(Clone)]
pub(crate) enum Step {
    Single(Arc<dyn Node>),
    /// Siblings sharing one step, merged in declared order.
    Group(Vec<Arc<dyn Node>>),
}

impl Step {
    pub(crate) fn members(&self) -> Vec<&Arc<dyn Node>> {
        match self {
            Step::Single(n) => vec![n],
            Step::Group(members) => members.iter().collect(),
        }
    }
}

/// A compiled, immutable graph.
pub struct Graph {
    pub(crate) name: String,
    pub(crate) schema: Arc<StateSchema>,
    pub(crate) entry: String,
    pub(crate) steps: HashMap<String, Step>,
    pub(crate) order: Vec<String>,
    pub(crate) transitions: HashMap<String, Transition>,
    pub(crate) config: ExecutorConfig,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn executor_config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Step names in registration order.
    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    /// A fresh state for this graph's schema.
    pub fn new_state(&self, input: Partial) -> WorkflowState {
        WorkflowState::with_input(self.schema.clone(), input)
    }
}

/// Collects nodes and edges, then validates them in `compile`.
pub struct GraphBuilder {
    name: String,
    schema: Arc<StateSchema>,
    entry: Option<String>,
    steps: Vec<(String, Step)>,
    transitions: Vec<(String, Transition)>,
    config: ExecutorConfig,
    errors: Vec<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, schema: Arc<StateSchema>) -> Self {
        Self {
            name: name.into(),
            schema,
            entry: None,
            steps: vec![],
            transitions: vec![],
            config: ExecutorConfig::default(),
            errors: vec![],
        }
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn set_executor(&mut self, config: ExecutorConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn set_entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    pub fn register_node(&mut self, node: impl Node) -> &mut Self {
        self.register_shared(Arc::new(node))
    }

    pub fn register_shared(&mut self, node: Arc<dyn Node>) -> &mut Self {
        let name = node.name().to_string();
        self.push_step(name, Step::Single(node));
        self
    }

    /// Register a closure as a node.
    pub fn register_fn(
        &mut self,
        name: &str,
        outputs: &[&str],
        body: impl Fn(&WorkflowState) -> Partial + Send + Sync + 'static,
    ) -> &mut Self {
        self.register_node(FnNode::new(name, outputs, body))
    }

    /// Register sibling nodes that run as one step under `name`.
    pub fn register_group(&mut self, name: impl Into<String>, members: Vec<Arc<dyn Node>>) -> &mut Self {
        let name = name.into();
        if members.is_empty() {
            self.errors.push(format!("group '{}' has no members", name));
        }
        self.push_step(name, Step::Group(members));
        self
    }

    pub fn register_edge(&mut self, from: &str, to: impl Into<Target>) -> &mut Self {
        self.push_transition(from, Transition::Always(to.into()));
        self
    }

    /// `router` maps the post-merge state to a label; `labels` maps each label to a target.
    pub fn register_conditional_edge<R, L, T>(&mut self, from: &str, router: R, labels: L) -> &mut Self
    where
        R: Fn(&WorkflowState) -> String + Send + Sync + 'static,
        L: IntoIterator<Item = (&'static str, T)>,
        T: Into<Target>,
    {
        let labels = labels
            .into_iter()
            .map(|(label, target)| (label.to_string(), target.into()))
            .collect();
        self.push_transition(
            from,
            Transition::Conditional {
                router: Arc::new(router),
                labels,
            },
        );
        self
    }

    fn push_step(&mut self, name: String, step: Step) {
        if self.steps.iter().any(|(n, _)| *n == name) {
            self.errors.push(format!("node '{}' registered twice", name));
            return;
        }
        self.steps.push((name, step));
    }

    fn push_transition(&mut self, from: &str, transition: Transition) {
        if self.transitions.iter().any(|(n, _)| n == from) {
            self.errors
                .push(format!("node '{}' has more than one outgoing edge", from));
            return;
        }
        self.transitions.push((from.to_string(), transition));
    }

    /// Validate and freeze the graph.
    pub fn compile(self) -> Result<Graph> {
        if let Some(first) = self.errors.first() {
            return Err(RefineryError::Graph(first.clone()));
        }
        self.schema.validate()?;

        let entry = self
            .entry
            .clone()
            .ok_or_else(|| RefineryError::Graph(format!("graph '{}' has no entry node", self.name)))?;

        let names: HashSet<&str> = self.steps.iter().map(|(n, _)| n.as_str()).collect();
        if !names.contains(entry.as_str()) {
            return Err(RefineryError::Graph(format!(
                "entry node '{}' is not registered",
                entry
            )));
        }

        for (from, transition) in &self.transitions {
            if !names.contains(from.as_str()) {
                return Err(RefineryError::Graph(format!(
                    "edge from unknown node '{}'",
                    from
                )));
            }
            for target in transition.targets() {
                if let Target::Node(to) = target {
                    if !names.contains(to.as_str()) {
                        return Err(RefineryError::Graph(format!(
                            "edge from '{}' to unknown node '{}'",
                            from, to
                        )));
                    }
                }
            }
        }

        let mut member_names = HashSet::new();
        for (_, step) in &self.steps {
            for node in step.members() {
                if !member_names.insert(node.name().to_string()) {
                    return Err(RefineryError::Graph(format!(
                        "node name '{}' is used twice",
                        node.name()
                    )));
                }
                self.check_outputs(node.as_ref())?;
            }
        }

        let order = self.steps.iter().map(|(n, _)| n.clone()).collect();
        Ok(Graph {
            name: self.name,
            schema: self.schema,
            entry,
            steps: self.steps.into_iter().collect(),
            order,
            transitions: self.transitions.into_iter().collect(),
            config: self.config,
        })
    }

    fn check_outputs(&self, node: &dyn Node) -> Result<()> {
        for field in node.outputs() {
            let Some(policy) = self.schema.policy(&field) else {
                return Err(RefineryError::Graph(format!(
                    "node '{}' writes undeclared field '{}'",
                    node.name(),
                    field
                )));
            };
            if let Some(inner) = node.schema().and_then(|s| s.policy(&field)) {
                if inner != policy {
                    return Err(RefineryError::Graph(format!(
                        "nested graph '{}' merges '{}' as {:?} but this graph uses {:?}",
                        node.name(),
                        field,
                        inner,
                        policy
                    )));
                }
            }
        }
        Ok(())
    }
}
