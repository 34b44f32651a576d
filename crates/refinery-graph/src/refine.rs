use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::convergence::{must_advance, IterationContext, Phase};
use crate::critic::{CriticNode, VERDICTS};
use crate::graph::{GraphBuilder, Node, END};
use crate::state::{Partial, WorkflowState};

/// Loop name → `IterationContext` of that refinement loop.
pub const ITERATIONS: &str = "iterations";

/// `prepare → members → followers… → critic → (prepare | END)`.
///
/// The loop repeats while its critic asks for another pass, at most
/// `max_iterations` passes per entry. Counters live under the loop's own
/// key in `iterations`, so loops nested inside another loop keep separate
/// budgets and start over each time they are re-entered.
pub struct RefinementLoop {
    name: String,
    max_iterations: u32,
}

impl RefinementLoop {
    pub fn new(name: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            name: name.into(),
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the loop and return the name of its first node.
    ///
    /// `members` run as one group step (concurrently in fan-out mode);
    /// `followers` run after it in order; `critic` decides whether to loop.
    pub fn wire(
        &self,
        builder: &mut GraphBuilder,
        members: Vec<Arc<dyn Node>>,
        followers: Vec<Arc<dyn Node>>,
        critic: CriticNode,
    ) -> String {
        let prepare = PrepareIteration {
            name: format!("{}_prepare", self.name),
            loop_name: self.name.clone(),
            verdict_key: critic.key().to_string(),
            max_iterations: self.max_iterations,
        };
        let prepare_name = prepare.name.clone();
        let verdict_key = prepare.verdict_key.clone();
        let critic_name = critic.name().to_string();
        builder.register_node(prepare);

        let mut previous = prepare_name.clone();
        let chain = match members.len() {
            0 => vec![],
            1 => members,
            _ => {
                let group = format!("{}_members", self.name);
                builder.register_group(group.clone(), members);
                builder.register_edge(&previous, group.clone());
                previous = group;
                vec![]
            }
        };
        for node in chain.into_iter().chain(followers) {
            let name = node.name().to_string();
            builder.register_shared(node);
            builder.register_edge(&previous, name.clone());
            previous = name;
        }
        builder.register_node(critic);
        builder.register_edge(&previous, critic_name.clone());

        let loop_name = self.name.clone();
        let max = self.max_iterations;
        builder.register_conditional_edge(
            &critic_name,
            move |s: &WorkflowState| {
                let attempts = s
                    .entry_as::<IterationContext>(ITERATIONS, &loop_name)
                    .map_or(max, |c| c.stage_attempts);
                let label = if must_advance(verdict(s, &verdict_key), attempts, max) {
                    "stop"
                } else {
                    "continue"
                };
                label.to_string()
            },
            [("continue", prepare_name.clone()), ("stop", END.to_string())],
        );
        prepare_name
    }
}

fn verdict(state: &WorkflowState, key: &str) -> bool {
    state
        .entry(VERDICTS, key)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Counts passes. A pass is fresh when there is no context yet or the
/// previous entry of the loop ran to completion.
struct PrepareIteration {
    name: String,
    loop_name: String,
    verdict_key: String,
    max_iterations: u32,
}

impl Node for PrepareIteration {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<String> {
        vec![ITERATIONS.into(), VERDICTS.into()]
    }

    fn outputs(&self) -> Vec<String> {
        vec![ITERATIONS.into()]
    }

    fn run<'a>(&'a self, state: &'a WorkflowState) -> BoxFuture<'a, Partial> {
        Box::pin(async move {
            let previous = state.entry_as::<IterationContext>(ITERATIONS, &self.loop_name);
            let wants_more = verdict(state, &self.verdict_key);
            let ctx = match previous {
                Some(mut ctx) if !must_advance(wants_more, ctx.stage_attempts, self.max_iterations) => {
                    ctx.stage_attempts += 1;
                    ctx.global_iteration += 1;
                    ctx.phase = Phase::Generating;
                    ctx
                }
                previous => {
                    let mut fresh = IterationContext::new(1, self.max_iterations);
                    fresh.global_iteration = previous.map_or(1, |c| c.global_iteration + 1);
                    fresh
                }
            };

            info!(
                refine_loop = %self.loop_name,
                iteration = ctx.stage_attempts,
                max = self.max_iterations,
                "Refinement pass"
            );
            Partial::new().entry(
                ITERATIONS,
                &self.loop_name,
                serde_json::to_value(&ctx).unwrap_or(Value::Null),
            )
        })
    }
}
