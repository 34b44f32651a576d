use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use refinery_core::traits::GenerationOracle;

use crate::graph::Node;
use crate::prompt::{build_messages, render_context, ContextSource};
use crate::state::{Partial, WorkflowState, FAILED_STEP, SHOULD_CONTINUE};

/// Where an agent writes its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputShape {
    /// The field itself holds the text.
    Text,
    /// The text goes under `key` of a map field.
    Entry(String),
}

#[derive(Debug, Clone)]
struct RefineFrom {
    field: String,
    keys: Vec<String>,
}

/// A free-text agent: instructions plus rendered state in, text out.
///
/// When refinement is configured and both a previous output and critique
/// exist, the agent revises its previous text instead of starting over.
pub struct AgentNode {
    name: String,
    instructions: String,
    task: String,
    context: Vec<ContextSource>,
    output_field: String,
    shape: OutputShape,
    refine: Option<RefineFrom>,
    oracle: Arc<dyn GenerationOracle>,
}

pub struct AgentNodeBuilder {
    name: String,
    instructions: String,
    task: String,
    context: Vec<ContextSource>,
    output: Option<(String, OutputShape)>,
    refine: Option<RefineFrom>,
}

impl AgentNode {
    pub fn builder(name: impl Into<String>) -> AgentNodeBuilder {
        let name = name.into();
        AgentNodeBuilder {
            instructions: format!("You are {}.", name.replace('_', " ")),
            task: "Write your analysis.".to_string(),
            context: vec![],
            output: None,
            refine: None,
            name,
        }
    }

    fn current(&self, state: &WorkflowState) -> Option<String> {
        let text = match &self.shape {
            OutputShape::Text => state.get_str(&self.output_field),
            OutputShape::Entry(key) => state.entry_str(&self.output_field, key),
        };
        text.filter(|t| !t.trim().is_empty()).map(str::to_string)
    }

    fn critique(&self, state: &WorkflowState) -> Option<String> {
        let refine = self.refine.as_ref()?;
        let parts: Vec<&str> = refine
            .keys
            .iter()
            .filter_map(|k| state.entry_str(&refine.field, k))
            .filter(|t| !t.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    fn write(&self, text: impl Into<String>) -> Partial {
        match &self.shape {
            OutputShape::Text => Partial::new().set(&self.output_field, text.into()),
            OutputShape::Entry(key) => Partial::new().entry(&self.output_field, key, text.into()),
        }
    }
}

impl AgentNodeBuilder {
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// What the agent is asked to produce, after the context.
    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn context(mut self, field: &str, label: &str) -> Self {
        self.context.push(ContextSource::field(field, label));
        self
    }

    /// Entries of a map field; all of them when `keys` is `None`.
    pub fn context_entries(mut self, field: &str, label: &str, keys: Option<Vec<String>>) -> Self {
        self.context.push(ContextSource::entries(field, label, keys));
        self
    }

    pub fn output(mut self, field: &str, shape: OutputShape) -> Self {
        self.output = Some((field.to_string(), shape));
        self
    }

    /// Revise from critique stored under `keys` of `field`.
    pub fn refine_from(mut self, field: &str, keys: &[&str]) -> Self {
        self.refine = Some(RefineFrom {
            field: field.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
        self
    }

    pub fn build(self, oracle: Arc<dyn GenerationOracle>) -> AgentNode {
        let (output_field, shape) = self
            .output
            .unwrap_or_else(|| (self.name.clone(), OutputShape::Text));
        AgentNode {
            name: self.name,
            instructions: self.instructions,
            task: self.task,
            context: self.context,
            output_field,
            shape,
            refine: self.refine,
            oracle,
        }
    }
}

impl Node for AgentNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        let mut inputs: Vec<String> = self
            .context
            .iter()
            .map(|c| c.field_name().to_string())
            .collect();
        if let Some(refine) = &self.refine {
            inputs.push(refine.field.clone());
        }
        inputs
    }

    fn outputs(&self) -> Vec<String> {
        vec![
            self.output_field.clone(),
            SHOULD_CONTINUE.into(),
            FAILED_STEP.into(),
        ]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let context = render_context(state, &self.context);

            if let (Some(previous), Some(critique)) = (self.current(state), self.critique(state)) {
                let task = format!(
                    "## Your previous version\n\n{}\n\n## Reviewer critique\n\n{}\n\n\
                     Revise your previous version to address the critique. Return the full revised text.",
                    previous, critique
                );
                let messages = build_messages(&self.instructions, &context, &task);
                return match self.oracle.generate(messages, None).await {
                    Ok(g) => {
                        debug!(agent = %self.name, "Refined");
                        self.write(g.text())
                    }
                    Err(e) => {
                        warn!(agent = %self.name, error = %e, "Refinement failed, keeping previous text");
                        self.write(previous)
                    }
                };
            }

            let messages = build_messages(&self.instructions, &context, &self.task);
            match self.oracle.generate(messages, None).await {
                Ok(g) => {
                    debug!(agent = %self.name, "Generated");
                    self.write(g.text())
                }
                Err(e) => {
                    warn!(agent = %self.name, error = %e, "Agent failed");
                    self.write(format!("Error analyzing with {}: {}", self.name, e))
                        .halt(state.schema(), &self.name)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MergePolicy, StateSchema};
    use refinery_core::error::RefineryError;
    use refinery_test_utils::ScriptedOracle;
    use serde_json::json;

    fn schema() -> Arc<StateSchema> {
        Arc::new(
            StateSchema::new()
                .field("input_data", MergePolicy::Overwrite, "")
                .field("analyses", MergePolicy::DictUnion, "")
                .field("critiques", MergePolicy::DictUnion, "")
                .field("final_report", MergePolicy::Overwrite, "")
                .with_halt_fields(),
        )
    }

    fn expert(oracle: ScriptedOracle) -> AgentNode {
        AgentNode::builder("market_analyst")
            .instructions("You analyze markets.")
            .context("input_data", "Document")
            .output("analyses", OutputShape::Entry("market_analyst".into()))
            .refine_from("critiques", &["finance", "meta"])
            .build(Arc::new(oracle))
    }

    #[tokio::test]
    async fn test_fresh_analysis() {
        let oracle = ScriptedOracle::new().then_text("Demand is flat.");
        let log = oracle.request_log();
        let node = expert(oracle);
        let state = WorkflowState::with_input(schema(), Partial::new().set("input_data", "Q3 sales table"));

        let p = node.run(&state).await;
        assert_eq!(p.get("analyses"), Some(&json!({"market_analyst": "Demand is flat."})));
        let sent = log.lock().unwrap();
        assert_eq!(sent[0][0].content, "You analyze markets.");
        assert!(sent[0][1].content.contains("Q3 sales table"));
    }

    #[tokio::test]
    async fn test_refines_from_critique() {
        let oracle = ScriptedOracle::new().then_text("Demand is flat; Q4 outlook added.");
        let log = oracle.request_log();
        let node = expert(oracle);
        let state = WorkflowState::with_input(
            schema(),
            Partial::new()
                .set("analyses", json!({"market_analyst": "Demand is flat."}))
                .set("critiques", json!({"meta": "Add an outlook."})),
        );

        let p = node.run(&state).await;
        assert_eq!(
            p.get("analyses"),
            Some(&json!({"market_analyst": "Demand is flat; Q4 outlook added."}))
        );
        let prompt = &log.lock().unwrap()[0][1].content;
        assert!(prompt.contains("Demand is flat."));
        assert!(prompt.contains("Add an outlook."));
    }

    #[tokio::test]
    async fn test_failure_writes_error_and_halts() {
        let oracle = ScriptedOracle::new().then_err(RefineryError::OracleRequest("HTTP 429".into()));
        let node = AgentNode::builder("final_synthesizer")
            .output("final_report", OutputShape::Text)
            .build(Arc::new(oracle));
        let state = WorkflowState::new(schema());

        let p = node.run(&state).await;
        let report = p.get("final_report").and_then(|v| v.as_str()).unwrap();
        assert!(report.starts_with("Error analyzing with final_synthesizer"));
        assert!(report.contains("HTTP 429"));
        assert_eq!(p.get(SHOULD_CONTINUE), Some(&json!(false)));
        assert_eq!(p.get(FAILED_STEP), Some(&json!("final_synthesizer")));
    }

    #[tokio::test]
    async fn test_failed_refinement_keeps_previous() {
        let oracle = ScriptedOracle::new().then_err(RefineryError::OracleRequest("timeout".into()));
        let node = expert(oracle);
        let state = WorkflowState::with_input(
            schema(),
            Partial::new()
                .set("analyses", json!({"market_analyst": "Demand is flat."}))
                .set("critiques", json!({"finance": "Check margins."})),
        );

        let p = node.run(&state).await;
        assert_eq!(p.get("analyses"), Some(&json!({"market_analyst": "Demand is flat."})));
        assert!(p.get(SHOULD_CONTINUE).is_none());
    }
}
