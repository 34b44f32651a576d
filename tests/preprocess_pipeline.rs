use std::sync::Arc;

use serde_json::json;

use refinery_core::config::{AppConfig, ExecutionMode};
use refinery_graph::artifact_loop::{ARTIFACTS, HISTORY, PROCESSED_DATA, REVIEW};
use refinery_graph::convergence::{IterationContext, Phase, ITERATION};
use refinery_graph::pipelines::preprocess::{build_preprocess_graph, preprocess_input, two_stage};
use refinery_graph::state::{FAILED_STEP, SHOULD_CONTINUE};
use refinery_graph::{invoke, WorkflowState};
use refinery_test_utils::{artifact, sample_records, verdict, ScriptedOracle, ScriptedSandbox};

fn config(max_attempts: u32) -> AppConfig {
    let mut config = AppConfig::parse("[model]\nmodel_id = \"m\"\napi_key = \"k\"\n").expect("parse config");
    config.pipeline.max_attempts = max_attempts;
    config
}

/// Drops records whose revenue is null, the way a cleaning script would.
fn drop_null_revenue() -> ScriptedSandbox {
    ScriptedSandbox::new(|code, mut bindings| {
        if code.contains("dropna") {
            let rows: Vec<serde_json::Value> = bindings["df"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| !r["revenue"].is_null())
                .collect();
            bindings.insert("df".into(), json!(rows));
        }
        Ok(bindings)
    })
}

#[tokio::test]
async fn test_two_stage_pipeline_end_to_end() {
    let oracle = ScriptedOracle::new()
        .then_for("artifact", artifact("df = pd.DataFrame(df).dropna()", "Drop incomplete rows."))
        .then_for("artifact", artifact("df = df[['revenue']]", "Keep revenue."))
        .repeat_for("review", verdict(false, "Looks right."));
    let graph = build_preprocess_graph(
        &config(10),
        &two_stage(),
        Arc::new(oracle),
        Arc::new(drop_null_revenue()),
    )
    .expect("build graph");

    let input = preprocess_input(sample_records(), "Sales with revenue, profit, cost.", "Normalize.");
    let state = invoke(&graph, graph.new_state(input)).await.expect("run");

    let cleaned = state.entry(PROCESSED_DATA, "cleaner").and_then(|v| v.as_array()).expect("cleaned");
    assert_eq!(cleaned.len(), 2);
    assert!(state.entry(PROCESSED_DATA, "extractor").is_some());
    assert_eq!(state.entry_str(REVIEW, "cleaner"), Some("Drop incomplete rows."));
    assert_eq!(state.entry_str(ARTIFACTS, "extractor"), Some("df = df[['revenue']]"));

    let ctx: IterationContext = state.get_as(ITERATION).expect("iteration context");
    assert_eq!(ctx.phase, Phase::Done);
    assert!(state.get(SHOULD_CONTINUE).is_none());
    assert!(state.is_done());
}

#[tokio::test]
async fn test_exhausted_retry_loop_stops_exactly_at_bound() {
    let oracle = ScriptedOracle::new()
        .repeat_for("artifact", artifact("df = df.explode()", "try"))
        .repeat_for("review", verdict(false, "ok"));
    let calls = oracle.call_counter();
    let graph = build_preprocess_graph(
        &config(4),
        &["cleaner".to_string()],
        Arc::new(oracle),
        Arc::new(ScriptedSandbox::always_failing("Traceback: KeyError")),
    )
    .expect("build graph");

    let state = invoke(&graph, graph.new_state(preprocess_input(json!([]), "", "")))
        .await
        .expect("run");
    assert_eq!(calls.get(), 4);
    assert_eq!(state.get_bool(SHOULD_CONTINUE), Some(false));
    assert_eq!(state.get_str(FAILED_STEP), Some("cleaner"));
}

#[tokio::test]
async fn test_fan_out_mode_yields_identical_state() {
    let run = |mode: ExecutionMode| async move {
        let oracle = ScriptedOracle::new()
            .repeat_for("artifact", artifact("df = df", "noop"))
            .repeat_for("review", verdict(false, "ok"));
        let mut cfg = config(3);
        cfg.executor.mode = mode;
        let stages = cfg.pipeline.stages.clone();
        let graph = build_preprocess_graph(&cfg, &stages, Arc::new(oracle), Arc::new(ScriptedSandbox::passthrough()))
            .expect("build graph");
        invoke(&graph, graph.new_state(preprocess_input(sample_records(), "d", "g")))
            .await
            .expect("run")
    };
    let sequential: WorkflowState = run(ExecutionMode::Sequential).await;
    let fan_out: WorkflowState = run(ExecutionMode::FanOut).await;
    assert!(sequential.get(HISTORY).is_some());
    assert_eq!(sequential, fan_out);
}
