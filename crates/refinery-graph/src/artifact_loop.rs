use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::{GenerationOracle, SandboxExecutor};
use refinery_core::types::{Bindings, ChatMessage, OutputSchema};

use crate::graph::Node;
use crate::state::{Partial, WorkflowState, FAILED_STEP, SHOULD_CONTINUE};

/// Stage name → data produced by that stage.
pub const PROCESSED_DATA: &str = "processed_data";
/// Stage name → rationale of the accepted artifact.
pub const REVIEW: &str = "review";
/// Stage name → accepted artifact body.
pub const ARTIFACTS: &str = "artifacts";
/// Stage name → conversation history.
pub const HISTORY: &str = "history";
pub const DESCRIPTION: &str = "description";
pub const GOAL: &str = "goal";

/// An executable candidate and its rationale.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub code: String,
    pub explanation: String,
}

/// One generate-then-execute try.
#[derive(Debug)]
struct Attempt {
    index: u32,
    result: Result<(Artifact, Bindings)>,
}

/// Result of a bounded artifact loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Succeeded {
        artifact: Artifact,
        bindings: Bindings,
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
        last_diagnostic: String,
    },
}

/// Generate a candidate, run it in the sandbox, and retry with a fresh
/// candidate on any failure, at most `max_attempts` times.
///
/// Each attempt runs on its own copy of the bindings; the caller's data is
/// never touched. Oracle errors, schema violations, and execution errors are
/// all treated alike.
pub struct ArtifactLoop {
    oracle: Arc<dyn GenerationOracle>,
    sandbox: Arc<dyn SandboxExecutor>,
    max_attempts: u32,
    schema: OutputSchema,
    required: Vec<String>,
}

impl ArtifactLoop {
    pub fn new(
        oracle: Arc<dyn GenerationOracle>,
        sandbox: Arc<dyn SandboxExecutor>,
        max_attempts: u32,
    ) -> Self {
        Self {
            oracle,
            sandbox,
            max_attempts: max_attempts.max(1),
            schema: OutputSchema::artifact(),
            required: vec![],
        }
    }

    /// Treat a run that leaves `name` unbound as a failure.
    pub fn require_binding(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run(&self, stage: &str, history: &[ChatMessage], bindings: &Bindings) -> LoopOutcome {
        let mut last_diagnostic = String::new();

        for index in 1..=self.max_attempts {
            let attempt = Attempt {
                index,
                result: self.attempt(history, bindings).await,
            };
            match attempt.result {
                Ok((artifact, bindings)) => {
                    info!(stage, attempts = attempt.index, "Artifact accepted");
                    return LoopOutcome::Succeeded {
                        artifact,
                        bindings,
                        attempts: attempt.index,
                    };
                }
                Err(e) => {
                    warn!(
                        stage,
                        attempt = attempt.index,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Artifact attempt failed"
                    );
                    last_diagnostic = e.to_string();
                }
            }
        }

        warn!(stage, max_attempts = self.max_attempts, "Artifact attempts exhausted");
        LoopOutcome::Exhausted {
            attempts: self.max_attempts,
            last_diagnostic,
        }
    }

    async fn attempt(&self, history: &[ChatMessage], bindings: &Bindings) -> Result<(Artifact, Bindings)> {
        let generation = self
            .oracle
            .generate(history.to_vec(), Some(&self.schema))
            .await?;
        let field = |name: &str| {
            generation.str_field(name).map(str::to_string).ok_or_else(|| {
                RefineryError::SchemaValidation {
                    schema: self.schema.name.clone(),
                    message: format!("missing field '{}'", name),
                }
            })
        };
        let artifact = Artifact {
            code: field("code")?,
            explanation: field("explanation")?,
        };

        let output = self.sandbox.execute(&artifact.code, bindings.clone()).await?;
        if let Some(missing) = self.required.iter().find(|r| !output.contains_key(*r)) {
            return Err(RefineryError::SandboxExecution(format!(
                "artifact left '{}' unbound",
                missing
            )));
        }
        Ok((artifact, output))
    }
}

/// Conversation as stored in state. Timestamps are dropped so that equal
/// runs produce equal states.
pub(crate) fn history_value(history: &[ChatMessage]) -> Value {
    let undated: Vec<ChatMessage> = history.iter().cloned().map(ChatMessage::undated).collect();
    serde_json::to_value(undated).unwrap_or(Value::Null)
}

/// Where a stage reads its input data.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Earlier stages, nearest first; the first one with output wins.
    pub previous: Vec<String>,
    /// Field used when no earlier stage produced data.
    pub raw_field: String,
}

impl StageInput {
    pub fn raw(field: &str) -> Self {
        Self {
            previous: vec![],
            raw_field: field.into(),
        }
    }

    fn resolve<'a>(&self, state: &'a WorkflowState) -> Option<&'a Value> {
        self.previous
            .iter()
            .find_map(|s| state.entry(PROCESSED_DATA, s))
            .or_else(|| state.get(&self.raw_field))
    }
}

/// A pipeline stage: runs an `ArtifactLoop` over its input data.
///
/// On success writes `processed_data.<stage>`, `review.<stage>`,
/// `artifacts.<stage>` and appends the accepted artifact to
/// `history.<stage>`. On exhaustion writes an error description to
/// `review.<stage>` plus `should_continue = false` and `failed_step`.
pub struct StageNode {
    name: String,
    instructions: String,
    input: StageInput,
    binding: String,
    artifact_loop: ArtifactLoop,
}

impl StageNode {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        input: StageInput,
        artifact_loop: ArtifactLoop,
    ) -> Self {
        let binding = "df".to_string();
        Self {
            name: name.into(),
            instructions: instructions.into(),
            input,
            artifact_loop: artifact_loop.require_binding(binding.clone()),
            binding,
        }
    }

    fn history(&self, state: &WorkflowState) -> Vec<ChatMessage> {
        if let Some(history) = state
            .entry_as::<Vec<ChatMessage>>(HISTORY, &self.name)
            .filter(|h| !h.is_empty())
        {
            return history;
        }
        let mut brief = String::new();
        if let Some(description) = state.get_str(DESCRIPTION) {
            brief.push_str(description);
            brief.push('\n');
        }
        if let Some(goal) = state.get_str(GOAL) {
            brief.push_str(goal);
            brief.push('\n');
        }
        brief.push_str(&format!(
            "The data is bound to the variable `{}`; leave the result in `{}`.",
            self.binding, self.binding
        ));
        vec![
            ChatMessage::system(self.instructions.clone()),
            ChatMessage::user(brief),
        ]
    }
}

impl Node for StageNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        vec![
            self.input.raw_field.clone(),
            PROCESSED_DATA.into(),
            HISTORY.into(),
            DESCRIPTION.into(),
            GOAL.into(),
        ]
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            PROCESSED_DATA.into(),
            REVIEW.into(),
            ARTIFACTS.into(),
            HISTORY.into(),
            SHOULD_CONTINUE.into(),
            FAILED_STEP.into(),
        ]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let mut history = self.history(state);
            let mut bindings = Bindings::new();
            bindings.insert(
                self.binding.clone(),
                self.input.resolve(state).cloned().unwrap_or(Value::Null),
            );

            match self.artifact_loop.run(&self.name, &history, &bindings).await {
                LoopOutcome::Succeeded {
                    artifact,
                    bindings,
                    ..
                } => {
                    history.push(ChatMessage::assistant(artifact.code.clone()));
                    let data = bindings.get(&self.binding).cloned().unwrap_or(Value::Null);
                    Partial::new()
                        .entry(PROCESSED_DATA, &self.name, data)
                        .entry(REVIEW, &self.name, artifact.explanation)
                        .entry(ARTIFACTS, &self.name, artifact.code)
                        .entry(HISTORY, &self.name, history_value(&history))
                }
                LoopOutcome::Exhausted {
                    attempts,
                    last_diagnostic,
                } => Partial::new()
                    .entry(
                        REVIEW,
                        &self.name,
                        format!(
                            "No working artifact after {} attempts. Last error: {}",
                            attempts, last_diagnostic
                        ),
                    )
                    .halt(state.schema(), &self.name),
            }
        })
    }
}
