//! Refinery workflow engine: a graph scheduler over a schema-declared state,
//! with a retry-bounded artifact loop, a critique-driven convergence
//! controller, and the preprocessing and expert panel pipelines built on them.

pub mod agent;
pub mod artifact_loop;
pub mod convergence;
pub mod critic;
pub mod graph;
pub mod pipelines;
pub mod prompt;
pub mod refine;
pub mod search;
pub mod state;

pub use agent::{AgentNode, OutputShape};
pub use artifact_loop::{Artifact, ArtifactLoop, LoopOutcome, StageInput, StageNode};
pub use convergence::{must_advance, ConvergenceController, IterationContext, Phase, ReviewedStage};
pub use critic::CriticNode;
pub use graph::{invoke, ExecutionResult, Executor, FnNode, Graph, GraphBuilder, Node, Target, END};
pub use refine::RefinementLoop;
pub use search::SearchNode;
pub use state::{MergePolicy, Partial, RunStatus, StateSchema, WorkflowState};
