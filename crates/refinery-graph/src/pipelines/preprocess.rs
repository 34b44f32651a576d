//! Data preprocessing: `cleaner → transformer → extractor`, each stage
//! generating code that runs against the previous stage's output and is
//! reviewed before the pipeline moves on.

use std::sync::Arc;

use serde_json::Value;

use refinery_core::config::AppConfig;
use refinery_core::error::Result;
use refinery_core::traits::{GenerationOracle, SandboxExecutor};

use crate::artifact_loop::{
    ArtifactLoop, StageInput, StageNode, ARTIFACTS, DESCRIPTION, GOAL, HISTORY, PROCESSED_DATA,
    REVIEW,
};
use crate::convergence::{ConvergenceController, IterationContext, ReviewedStage, ITERATION};
use crate::critic::{CriticNode, CRITIQUES, VERDICTS};
use crate::graph::{Graph, GraphBuilder};
use crate::prompt::ContextSource;
use crate::state::{MergePolicy, Partial, StateSchema};

pub const RAW_DATA: &str = "raw_data";

/// Stage order of the shorter pipeline variant.
pub fn two_stage() -> Vec<String> {
    vec!["cleaner".into(), "extractor".into()]
}

pub fn preprocess_schema() -> StateSchema {
    StateSchema::new()
        .field(RAW_DATA, MergePolicy::Overwrite, "Input records")
        .field(DESCRIPTION, MergePolicy::Overwrite, "What the data contains")
        .field(GOAL, MergePolicy::Overwrite, "What the processing should achieve")
        .field(PROCESSED_DATA, MergePolicy::DictUnion, "Output of each stage")
        .field(REVIEW, MergePolicy::DictUnion, "Rationale of each stage's code")
        .field(ARTIFACTS, MergePolicy::DictUnion, "Accepted code of each stage")
        .field(HISTORY, MergePolicy::DictUnion, "Conversation of each stage")
        .field(CRITIQUES, MergePolicy::DictUnion, "Latest review of each stage")
        .field(VERDICTS, MergePolicy::DictUnion, "Whether a stage wants another pass")
        .field(ITERATION, MergePolicy::Overwrite, "Convergence controller context")
        .with_halt_fields()
}

/// Initial state fields for a run over `raw`.
pub fn preprocess_input(raw: Value, description: &str, goal: &str) -> Partial {
    Partial::new()
        .set(RAW_DATA, raw)
        .set(DESCRIPTION, description)
        .set(GOAL, goal)
}

pub fn stage_instructions(stage: &str) -> String {
    let role = match stage {
        "cleaner" => {
            "You clean tabular data. Fix column names, coerce types, handle missing values \
             and duplicates, and drop rows that cannot be repaired."
        }
        "transformer" => {
            "You transform cleaned tabular data. Normalize or scale numeric columns, encode \
             categories and derive columns that serve the goal."
        }
        "extractor" => {
            "You extract the features that matter for the goal from prepared tabular data \
             and keep only those columns."
        }
        _ => "You process tabular data toward the stated goal.",
    };
    format!(
        "{}\n\nWrite Python code. The data is a list of records bound to `df`; you may \
         convert it with pandas, but the code must leave the result in `df`. Put the code \
         in `code` and a short account of what it does in `explanation`.",
        role
    )
}

const STAGE_CRITIC_INSTRUCTIONS: &str = "You review data preprocessing code and its output. \
Check that the code does what the goal asks, that the output is sensible, and that nothing \
important was lost. Ask for another pass only for concrete problems.";

fn stage_critic(stage: &str, oracle: Arc<dyn GenerationOracle>) -> CriticNode {
    let only = Some(vec![stage.to_string()]);
    CriticNode::new(format!("{}_critic", stage), stage, STAGE_CRITIC_INSTRUCTIONS, oracle)
        .context(ContextSource::field(DESCRIPTION, "Data description"))
        .context(ContextSource::field(GOAL, "Goal"))
        .context(ContextSource::entries(ARTIFACTS, "Code", only.clone()))
        .context(ContextSource::entries(REVIEW, "Explanation", only.clone()))
        .context(ContextSource::entries(PROCESSED_DATA, "Output", only))
}

/// Build the preprocessing graph for `stages`, reviewed and retried per
/// the `[pipeline]` section of `config`.
pub fn build_preprocess_graph(
    config: &AppConfig,
    stages: &[String],
    oracle: Arc<dyn GenerationOracle>,
    sandbox: Arc<dyn SandboxExecutor>,
) -> Result<Graph> {
    let mut builder = GraphBuilder::new("preprocess", Arc::new(preprocess_schema()));
    builder.set_executor(config.executor.clone());

    let reviewed = stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let input = StageInput {
                previous: stages[..i].iter().rev().cloned().collect(),
                raw_field: RAW_DATA.to_string(),
            };
            let artifact_loop =
                ArtifactLoop::new(oracle.clone(), sandbox.clone(), config.pipeline.max_attempts);
            ReviewedStage {
                stage: Arc::new(StageNode::new(
                    stage.clone(),
                    stage_instructions(stage),
                    input,
                    artifact_loop,
                )),
                critic: Arc::new(stage_critic(stage, oracle.clone())),
            }
        })
        .collect();

    ConvergenceController::new(config.pipeline.max_stage_attempts).wire(&mut builder, reviewed);
    builder.compile()
}

/// Starting controller context for `stages`.
pub fn initial_iteration(config: &AppConfig, stages: &[String]) -> IterationContext {
    IterationContext::new(stages.len(), config.pipeline.max_stage_attempts)
}
