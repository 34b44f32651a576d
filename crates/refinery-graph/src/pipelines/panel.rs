//! Expert panel: groups of expert agents analyze a document, each group
//! summarizes and critiques itself, and a final synthesizer writes the
//! report under review of a meta critic.

use std::collections::HashSet;
use std::sync::Arc;

use refinery_core::config::{AppConfig, PanelGroupConfig};
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::{GenerationOracle, SearchOracle};

use crate::agent::{AgentNode, OutputShape};
use crate::critic::{CriticNode, CRITIQUES, VERDICTS};
use crate::graph::{Graph, GraphBuilder, Node};
use crate::prompt::ContextSource;
use crate::refine::{RefinementLoop, ITERATIONS};
use crate::search::{SearchNode, SEARCH_RESULTS};
use crate::state::{MergePolicy, Partial, StateSchema};

pub const INPUT_DATA: &str = "input_data";
pub const FILE_NAME: &str = "file_name";
pub const ANALYSES: &str = "analyses";
pub const GROUP_SUMMARIES: &str = "group_summaries";
pub const FINAL_REPORT: &str = "final_report";
/// Critique key of the meta critic.
pub const META: &str = "meta";
/// Name of the outer refinement loop; also its key in `iterations`.
pub const PANEL: &str = "panel";

const EXPERT_TASK: &str = "Analyze the data above from the perspective of your field. Give \
findings, assessments and detailed recommendations, focusing on the most important factors \
you see in the data.";

const FINAL_TASK: &str = "Write the final report with these sections:\n\
1. Executive summary\n\
2. Key findings from each expert group\n\
3. Links and consistency between the analyses\n\
4. Recommendations and concrete next steps\n\
5. Conclusion";

const SYNTHESIZER_INSTRUCTIONS: &str = "You write the final report. Combine the summaries of \
all expert groups into one comprehensive, coherent and actionable report with concrete \
conclusions and recommendations.";

const META_CRITIC_INSTRUCTIONS: &str = "You are the meta critic. Evaluate the final report \
built from all expert groups. Identify contradictions, overlaps and gaps between groups, \
perspectives that were missed, and recommendations that need more detail. Judge the balance \
between viewpoints and how well the report covers the key issues in the source data.";

pub fn panel_schema() -> StateSchema {
    StateSchema::new()
        .field(INPUT_DATA, MergePolicy::Overwrite, "Document under analysis")
        .field(FILE_NAME, MergePolicy::Overwrite, "Name of the document")
        .field(SEARCH_RESULTS, MergePolicy::DictUnion, "Web search hits per search node")
        .field(ANALYSES, MergePolicy::DictUnion, "Analysis of each expert")
        .field(GROUP_SUMMARIES, MergePolicy::DictUnion, "Summary of each group")
        .field(FINAL_REPORT, MergePolicy::Overwrite, "Synthesized report")
        .field(CRITIQUES, MergePolicy::DictUnion, "Latest critique per group and meta")
        .field(VERDICTS, MergePolicy::DictUnion, "Whether a loop wants another pass")
        .field(ITERATIONS, MergePolicy::DictUnion, "Refinement loop counters")
        .with_halt_fields()
}

pub fn panel_input(input_data: &str, file_name: &str) -> Partial {
    Partial::new()
        .set(INPUT_DATA, input_data)
        .set(FILE_NAME, file_name)
}

fn expert_instructions(name: &str, group: &PanelGroupConfig) -> String {
    format!(
        "You are a {} in the {} expert group. Analyze documents strictly from the \
         standpoint of your specialty and be specific about the evidence you rely on.",
        name.replace('_', " "),
        group.title()
    )
}

fn group_critic_instructions(group: &PanelGroupConfig) -> String {
    format!(
        "You are the critic of the {} expert group. Evaluate the experts' analyses and the \
         group summary objectively: point out weaknesses, gaps and contradictions, aspects of \
         the data that were ignored, and concrete improvements for each expert. Rate issues as \
         high, medium or low severity.",
        group.title()
    )
}

/// One group as a nested graph: experts, summarizer and critic in a loop.
fn build_group(
    config: &AppConfig,
    group: &PanelGroupConfig,
    schema: Arc<StateSchema>,
    oracle: &Arc<dyn GenerationOracle>,
) -> Result<Graph> {
    let experts: Vec<String> = group.experts.iter().map(|e| e.name.clone()).collect();
    let critique_keys = [group.name.as_str(), META];

    let members: Vec<Arc<dyn Node>> = group
        .experts
        .iter()
        .map(|expert| {
            let instructions = expert
                .instructions
                .clone()
                .unwrap_or_else(|| expert_instructions(&expert.name, group));
            Arc::new(
                AgentNode::builder(expert.name.clone())
                    .instructions(instructions)
                    .task(EXPERT_TASK)
                    .context(FILE_NAME, "Document name")
                    .context(INPUT_DATA, "Document")
                    .context_entries(SEARCH_RESULTS, "Web search results", None)
                    .output(ANALYSES, OutputShape::Entry(expert.name.clone()))
                    .refine_from(CRITIQUES, &critique_keys)
                    .build(oracle.clone()),
            ) as Arc<dyn Node>
        })
        .collect();

    let summarizer = AgentNode::builder(format!("{}_summarizer", group.name))
        .instructions(format!(
            "You summarize the opinions of the {} expert group. Connect the experts' views, \
             find where they agree and differ, and conclude from the group's perspective.",
            group.title()
        ))
        .task("Write a comprehensive summary of this group's perspective.")
        .context(FILE_NAME, "Document name")
        .context_entries(ANALYSES, "Expert analyses", Some(experts.clone()))
        .output(GROUP_SUMMARIES, OutputShape::Entry(group.name.clone()))
        .refine_from(CRITIQUES, &critique_keys)
        .build(oracle.clone());

    let critic = CriticNode::new(
        format!("{}_critic", group.name),
        group.name.clone(),
        group_critic_instructions(group),
        oracle.clone(),
    )
    .context(ContextSource::field(FILE_NAME, "Document name"))
    .context(ContextSource::entries(ANALYSES, "Expert analyses", Some(experts)))
    .context(ContextSource::entries(
        GROUP_SUMMARIES,
        "Group summary",
        Some(vec![group.name.clone()]),
    ));

    let mut builder = GraphBuilder::new(group.name.clone(), schema);
    builder.set_executor(config.executor.clone());
    let entry = RefinementLoop::new(group.name.clone(), config.refine.max_iterations).wire(
        &mut builder,
        members,
        vec![Arc::new(summarizer) as Arc<dyn Node>],
        critic,
    );
    builder.set_entry(entry);
    builder.compile()
}

fn check_groups(groups: &[PanelGroupConfig]) -> Result<()> {
    if groups.is_empty() {
        return Err(RefineryError::Config("panel.groups is empty".into()));
    }
    let mut seen = HashSet::new();
    for group in groups {
        if group.experts.is_empty() {
            return Err(RefineryError::Config(format!(
                "panel group '{}' has no experts",
                group.name
            )));
        }
        let names = std::iter::once(&group.name).chain(group.experts.iter().map(|e| &e.name));
        for name in names {
            if name == META || name == PANEL || !seen.insert(name.clone()) {
                return Err(RefineryError::Config(format!(
                    "panel name '{}' is reserved or used twice",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Build the panel graph from `[[panel.groups]]`. With a search backend,
/// one web search runs first and its hits are shown to every expert.
pub fn build_panel_graph(
    config: &AppConfig,
    oracle: Arc<dyn GenerationOracle>,
    search: Option<Arc<dyn SearchOracle>>,
) -> Result<Graph> {
    check_groups(&config.panel.groups)?;
    let schema = Arc::new(panel_schema());

    let groups = config
        .panel
        .groups
        .iter()
        .map(|g| build_group(config, g, schema.clone(), &oracle).map(|g| Arc::new(g) as Arc<dyn Node>))
        .collect::<Result<Vec<_>>>()?;

    let synthesizer = AgentNode::builder("final_synthesizer")
        .instructions(SYNTHESIZER_INSTRUCTIONS)
        .task(FINAL_TASK)
        .context(FILE_NAME, "Document name")
        .context_entries(GROUP_SUMMARIES, "Group summaries", None)
        .output(FINAL_REPORT, OutputShape::Text)
        .refine_from(CRITIQUES, &[META])
        .build(oracle.clone());

    let meta_critic = CriticNode::new("meta_critic", META, META_CRITIC_INSTRUCTIONS, oracle)
        .context(ContextSource::field(INPUT_DATA, "Source document"))
        .context(ContextSource::entries(GROUP_SUMMARIES, "Group summaries", None))
        .context(ContextSource::field(FINAL_REPORT, "Final report"));

    let mut builder = GraphBuilder::new(PANEL, schema);
    builder.set_executor(config.executor.clone());
    let entry = RefinementLoop::new(PANEL, config.refine.max_iterations).wire(
        &mut builder,
        groups,
        vec![Arc::new(synthesizer) as Arc<dyn Node>],
        meta_critic,
    );

    match search {
        Some(search) => {
            builder
                .register_node(SearchNode::new("web_search", search).query_from(INPUT_DATA))
                .register_edge("web_search", entry)
                .set_entry("web_search");
        }
        None => {
            builder.set_entry(entry);
        }
    }
    builder.compile()
}
