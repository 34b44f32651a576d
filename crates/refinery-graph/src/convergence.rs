//! Convergence controller.
//!
//! Drives each pipeline stage through `Generating → UnderReview →
//! (Generating | Advancing)` and the pipeline through its stages in order.
//! The context lives in the `iteration` field and is only written by the
//! per-stage gate node; the routers just read it.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use refinery_core::types::ChatMessage;

use crate::artifact_loop::{history_value, HISTORY};
use crate::critic::{CRITIQUES, VERDICTS};
use crate::graph::{GraphBuilder, Node, END};
use crate::state::{Partial, WorkflowState, FAILED_STEP};

/// Serialized `IterationContext` of the stage pipeline.
pub const ITERATION: &str = "iteration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generating,
    UnderReview,
    Advancing,
    Done,
}

/// Forced-advance rule shared by the stage controller and `RefinementLoop`:
/// move on when the critic is satisfied or the attempt budget is spent.
pub fn must_advance(wants_more: bool, attempts_used: u32, cap: u32) -> bool {
    !wants_more || attempts_used >= cap
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationContext {
    pub phase: Phase,
    pub stage_index: usize,
    pub stage_count: usize,
    /// 1-based attempt number within the current stage.
    pub stage_attempts: u32,
    /// Entries into `Generating` over the whole run.
    pub global_iteration: u32,
    pub max_stage_attempts: u32,
    pub max_iterations: u32,
    /// Critique received for the current stage, oldest first.
    #[serde(default)]
    pub critique: Vec<String>,
}

impl IterationContext {
    pub fn new(stage_count: usize, max_stage_attempts: u32) -> Self {
        let max_stage_attempts = max_stage_attempts.max(1);
        Self {
            phase: if stage_count == 0 {
                Phase::Done
            } else {
                Phase::Generating
            },
            stage_index: 0,
            stage_count,
            stage_attempts: 1,
            global_iteration: 1,
            max_stage_attempts,
            max_iterations: stage_count as u32 * max_stage_attempts,
            critique: vec![],
        }
    }

    /// Position at the start of `index`, keeping the global count.
    pub fn entering(mut self, index: usize) -> Self {
        self.phase = Phase::Generating;
        self.stage_index = index;
        self.stage_attempts = 1;
        self.critique.clear();
        self
    }

    pub fn on_artifact(mut self) -> Self {
        if self.phase == Phase::Generating {
            self.phase = Phase::UnderReview;
        }
        self
    }

    /// The stage produced nothing usable; skip review.
    pub fn on_exhausted(mut self) -> Self {
        if self.phase == Phase::Generating {
            self.phase = Phase::Advancing;
        }
        self
    }

    pub fn on_verdict(mut self, wants_revision: bool, critique: Option<&str>) -> Self {
        if self.phase != Phase::UnderReview {
            return self;
        }
        if let Some(text) = critique.filter(|t| !t.trim().is_empty()) {
            self.critique.push(text.to_string());
        }
        if must_advance(wants_revision, self.stage_attempts, self.max_stage_attempts) {
            self.phase = Phase::Advancing;
        } else {
            self.phase = Phase::Generating;
            self.stage_attempts += 1;
            self.global_iteration += 1;
        }
        self
    }

    pub fn advance(mut self) -> Self {
        if self.phase != Phase::Advancing {
            return self;
        }
        if self.stage_index + 1 < self.stage_count {
            self.global_iteration += 1;
            let next = self.stage_index + 1;
            self.entering(next)
        } else {
            self.phase = Phase::Done;
            self
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// A stage node and the critic that reviews its output.
pub struct ReviewedStage {
    pub stage: Arc<dyn Node>,
    pub critic: Arc<dyn Node>,
}

/// Wires `stage → critic → gate` for each stage, in order.
pub struct ConvergenceController {
    max_stage_attempts: u32,
}

impl ConvergenceController {
    pub fn new(max_stage_attempts: u32) -> Self {
        Self {
            max_stage_attempts: max_stage_attempts.max(1),
        }
    }

    pub fn wire(&self, builder: &mut GraphBuilder, stages: Vec<ReviewedStage>) {
        let names: Vec<String> = stages.iter().map(|s| s.stage.name().to_string()).collect();
        if let Some(first) = names.first() {
            builder.set_entry(first.clone());
        }

        for (index, reviewed) in stages.into_iter().enumerate() {
            let stage = names[index].clone();
            let critic = reviewed.critic.name().to_string();
            let gate = StageGate {
                name: format!("{}_gate", stage),
                stage: stage.clone(),
                index,
                stage_count: names.len(),
                max_stage_attempts: self.max_stage_attempts,
            };
            let gate_name = gate.name.clone();

            builder
                .register_shared(reviewed.stage)
                .register_shared(reviewed.critic)
                .register_node(gate);

            let failed_stage = stage.clone();
            builder.register_conditional_edge(
                &stage,
                move |s: &WorkflowState| {
                    let label = if s.get_str(FAILED_STEP) == Some(failed_stage.as_str()) {
                        "failed"
                    } else {
                        "ok"
                    };
                    label.to_string()
                },
                [("ok", critic.clone()), ("failed", gate_name.clone())],
            );
            builder.register_edge(&critic, gate_name.clone());

            let mut labels = vec![("retry", stage.clone()), ("done", END.to_string())];
            if let Some(next) = names.get(index + 1) {
                labels.push(("advance", next.clone()));
            }
            builder.register_conditional_edge(&gate_name, gate_router(index), labels);
        }
    }
}

fn gate_router(index: usize) -> impl Fn(&WorkflowState) -> String + Send + Sync + 'static {
    move |state| {
        let label = match state.get_as::<IterationContext>(ITERATION) {
            Some(ctx) if ctx.phase == Phase::Generating && ctx.stage_index == index => "retry",
            Some(ctx) if ctx.phase == Phase::Generating => "advance",
            _ => "done",
        };
        label.to_string()
    }
}

/// Applies the stage outcome and the critic's verdict to the context.
struct StageGate {
    name: String,
    stage: String,
    index: usize,
    stage_count: usize,
    max_stage_attempts: u32,
}

impl StageGate {
    fn current(&self, state: &WorkflowState) -> IterationContext {
        match state.get_as::<IterationContext>(ITERATION) {
            Some(ctx) if ctx.stage_index == self.index && ctx.phase == Phase::Generating => ctx,
            Some(ctx) => ctx.entering(self.index),
            None => IterationContext::new(self.stage_count, self.max_stage_attempts).entering(self.index),
        }
    }
}

impl Node for StageGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        vec![
            ITERATION.into(),
            FAILED_STEP.into(),
            VERDICTS.into(),
            CRITIQUES.into(),
            HISTORY.into(),
        ]
    }

    fn outputs(&self) -> Vec<String> {
        vec![ITERATION.into(), HISTORY.into()]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let ctx = self.current(state);
            let critique = state.entry_str(CRITIQUES, &self.stage);
            let ctx = if state.get_str(FAILED_STEP) == Some(self.stage.as_str()) {
                ctx.on_exhausted()
            } else {
                let wants_revision = state
                    .entry(VERDICTS, &self.stage)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                ctx.on_artifact().on_verdict(wants_revision, critique)
            };

            let mut partial = Partial::new();
            if ctx.phase == Phase::Generating {
                info!(
                    stage = %self.stage,
                    attempt = ctx.stage_attempts,
                    max = ctx.max_stage_attempts,
                    "Revising stage after critique"
                );
                let mut history: Vec<ChatMessage> =
                    state.entry_as(HISTORY, &self.stage).unwrap_or_default();
                history.push(ChatMessage::user(format!(
                    "A reviewer examined your last code and its output:\n{}\n\nRevise the code to address this feedback.",
                    critique.unwrap_or("(no details)")
                )));
                partial = partial.entry(HISTORY, &self.stage, history_value(&history));
            } else {
                info!(stage = %self.stage, attempts = ctx.stage_attempts, "Stage complete");
            }

            let ctx = ctx.advance();
            partial.insert(ITERATION, serde_json::to_value(&ctx).unwrap_or(Value::Null));
            partial
        })
    }
}
