use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use refinery_core::config::{AppConfig, DEFAULT_CONFIG};
use refinery_core::traits::{GenerationOracle, SandboxExecutor, SearchOracle};
use refinery_graph::pipelines::{panel, preprocess};
use refinery_graph::state::{FAILED_STEP, SHOULD_CONTINUE};
use refinery_graph::ExecutionResult;

const DEFAULT_CONFIG_PATH: &str = "refinery.toml";

#[derive(Parser)]
#[command(name = "refinery", version, about = "Graph-driven generate, review and refine pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean, transform and extract a JSON table with generated code
    Preprocess {
        /// JSON file holding the records
        data: PathBuf,
        /// What the data contains
        #[arg(short, long, default_value = "")]
        description: String,
        /// What the processing should achieve
        #[arg(short, long, default_value = "Prepare the data for analysis.")]
        goal: String,
        /// Run only cleaner and extractor
        #[arg(long, conflicts_with = "stages")]
        two_stage: bool,
        /// Explicit stage order (comma-separated)
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
    },
    /// Analyze a document with the expert panel
    Analyze {
        /// Text document to analyze
        file: PathBuf,
        /// Skip the web search even if one is configured
        #[arg(long)]
        no_search: bool,
    },
    /// Show current configuration
    Config,
    /// Validate configuration and build both pipelines
    Check,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("refinery=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "refinery", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Check => {
            check(&config)?;
        }
        Commands::Preprocess {
            data,
            description,
            goal,
            two_stage,
            stages,
        } => {
            config.validate()?;
            let stages = if two_stage {
                preprocess::two_stage()
            } else if stages.is_empty() {
                config.pipeline.stages.clone()
            } else {
                stages
            };
            let result = run_preprocess(&config, &data, &description, &goal, &stages).await?;
            print_result(&result)?;
        }
        Commands::Analyze { file, no_search } => {
            config.validate()?;
            let result = run_analyze(&config, &file, !no_search).await?;
            print_result(&result)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new(DEFAULT_CONFIG_PATH) {
        warn!("No refinery.toml found, using built-in defaults (model key from OPENAI_API_KEY)");
        return Ok(AppConfig::parse(DEFAULT_CONFIG)?);
    }
    anyhow::bail!("config file not found: {}", path.display())
}

fn oracle(config: &AppConfig) -> anyhow::Result<Arc<dyn GenerationOracle>> {
    Ok(Arc::new(refinery_llm::oracle_from_config(config)?))
}

async fn run_preprocess(
    config: &AppConfig,
    data: &Path,
    description: &str,
    goal: &str,
    stages: &[String],
) -> anyhow::Result<ExecutionResult> {
    let text = std::fs::read_to_string(data).with_context(|| format!("reading {}", data.display()))?;
    let raw: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", data.display()))?;

    let sandbox: Arc<dyn SandboxExecutor> = Arc::from(refinery_tools::sandbox_from_config(&config.sandbox));
    let graph = preprocess::build_preprocess_graph(config, stages, oracle(config)?, sandbox)?;

    info!(stages = %stages.join(" → "), sandbox = %config.sandbox.mode, "Running preprocessing pipeline");
    let input = preprocess::preprocess_input(raw, description, goal);
    Ok(graph.invoke(graph.new_state(input)).await?)
}

async fn run_analyze(config: &AppConfig, file: &Path, search: bool) -> anyhow::Result<ExecutionResult> {
    let input_data =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let search: Option<Arc<dyn SearchOracle>> = if search {
        refinery_tools::search_from_config(config.web_search.as_ref()).map(Arc::from)
    } else {
        None
    };
    let graph = panel::build_panel_graph(config, oracle(config)?, search)?;

    info!(
        file = %file_name,
        groups = config.panel.groups.len(),
        "Running expert panel"
    );
    let input = panel::panel_input(&input_data, &file_name);
    Ok(graph.invoke(graph.new_state(input)).await?)
}

fn check(config: &AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("  config       ok ({} / {})", config.model.provider, config.model.model_id);

    let sandbox: Arc<dyn SandboxExecutor> = Arc::from(refinery_tools::sandbox_from_config(&config.sandbox));
    let stages = config.pipeline.stages.clone();
    let graph = preprocess::build_preprocess_graph(config, &stages, oracle(config)?, sandbox)?;
    println!("  preprocess   ok ({} steps: {})", graph.step_names().len(), stages.join(" → "));

    let search: Option<Arc<dyn SearchOracle>> =
        refinery_tools::search_from_config(config.web_search.as_ref()).map(Arc::from);
    let graph = panel::build_panel_graph(config, oracle(config)?, search)?;
    println!(
        "  panel        ok ({} groups, {} steps)",
        config.panel.groups.len(),
        graph.step_names().len()
    );
    Ok(())
}

fn print_result(result: &ExecutionResult) -> anyhow::Result<()> {
    let state = &result.state;
    if state.get_bool(SHOULD_CONTINUE) == Some(false) {
        warn!(
            failed_step = state.get_str(FAILED_STEP).unwrap_or("unknown"),
            "Run finished degraded"
        );
    }
    info!(
        steps = result.trace.len(),
        total_elapsed_ms = result.total_elapsed_ms,
        "Run complete"
    );
    println!("{}", serde_json::to_string_pretty(&state.to_json())?);
    Ok(())
}
