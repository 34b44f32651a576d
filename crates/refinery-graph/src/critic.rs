use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use refinery_core::traits::GenerationOracle;
use refinery_core::types::OutputSchema;

use crate::graph::Node;
use crate::prompt::{build_messages, render_context, ContextSource};
use crate::state::{Partial, WorkflowState, FAILED_STEP, SHOULD_CONTINUE};

/// Key → latest critique text.
pub const CRITIQUES: &str = "critiques";
/// Key → latest verdict; `true` asks for another pass.
pub const VERDICTS: &str = "verdicts";

const DEFAULT_TASK: &str = "Review the work above. Set should_continue to true only if another \
revision would clearly improve it, and explain what to change in review.";

/// Asks the oracle for a `{should_continue, review}` verdict on the state.
///
/// Results land under `key` in `critiques` and `verdicts`. An oracle failure
/// becomes a negative verdict whose critique describes the error.
pub struct CriticNode {
    name: String,
    key: String,
    instructions: String,
    task: String,
    context: Vec<ContextSource>,
    oracle: Arc<dyn GenerationOracle>,
    schema: OutputSchema,
}

impl CriticNode {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        instructions: impl Into<String>,
        oracle: Arc<dyn GenerationOracle>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            instructions: instructions.into(),
            task: DEFAULT_TASK.to_string(),
            context: vec![],
            oracle,
            schema: OutputSchema::review(),
        }
    }

    pub fn context(mut self, source: ContextSource) -> Self {
        self.context.push(source);
        self
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Node for CriticNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        self.context.iter().map(|c| c.field_name().to_string()).collect()
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            CRITIQUES.into(),
            VERDICTS.into(),
            SHOULD_CONTINUE.into(),
            FAILED_STEP.into(),
        ]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let context = render_context(state, &self.context);
            let messages = build_messages(&self.instructions, &context, &self.task);

            match self.oracle.generate(messages, Some(&self.schema)).await {
                Ok(generation) => {
                    let wants_revision = generation.bool_field("should_continue").unwrap_or(false);
                    let review = generation.str_field("review").unwrap_or_default().to_string();
                    debug!(critic = %self.name, wants_revision, "Verdict");
                    Partial::new()
                        .entry(CRITIQUES, &self.key, review)
                        .entry(VERDICTS, &self.key, wants_revision)
                }
                Err(e) => {
                    warn!(critic = %self.name, error = %e, "Critic failed");
                    Partial::new()
                        .entry(CRITIQUES, &self.key, format!("Error in {}: {}", self.name, e))
                        .entry(VERDICTS, &self.key, false)
                        .halt(state.schema(), &self.name)
                }
            }
        })
    }
}
