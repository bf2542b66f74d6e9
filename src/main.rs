use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepgraph_agent::{
    builtin_catalog, question_input, Executor, MemoryCheckpointStore, RunHandle, RunManager,
    SqliteCheckpointStore,
};
use stepgraph_core::config::{AppConfig, ModelConfig};
use stepgraph_core::traits::{ChatModel, CheckpointStore};
use stepgraph_core::types::{GraphEvent, RunId, RunStatus};
use stepgraph_tools::ToolRegistry;

/// History field every built-in template reads and writes.
const HISTORY: &str = stepgraph_agent::templates::MESSAGES;

#[derive(Parser)]
#[command(name = "stepgraph", version, about = "Graph-based agent runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "STEPGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run of a catalog graph
    Run {
        /// Graph to run (see `stepgraph graphs`)
        #[arg(short, long, default_value = "chat_with_tools")]
        graph: String,
        /// Print node and tool progress while the run executes
        #[arg(long)]
        stream: bool,
        /// The question; read from stdin when omitted
        #[arg(trailing_var_arg = true)]
        question: Vec<String>,
    },
    /// Reply to a run waiting for input
    Resume {
        run_id: String,
        #[arg(trailing_var_arg = true, required = true)]
        reply: Vec<String>,
    },
    /// List catalog graphs
    Graphs,
    /// Print a graph as a Mermaid flowchart
    Graph { name: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "stepgraph=debug,warn" } else { "stepgraph=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepgraph", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&redacted(&config))?);
        return Ok(());
    }

    let model: Arc<dyn ChatModel> = Arc::from(stepgraph_llm::build_model(&config.model));
    let tools = ToolRegistry::with_builtins();
    let catalog = builtin_catalog(model, tools, &config.executor, &config.agents)?;

    let checkpoint = config.checkpoint.clone().unwrap_or_default();
    let store: Arc<dyn CheckpointStore> = if checkpoint.enabled {
        let path = checkpoint.db_path();
        info!(path = %path.display(), "Using SQLite checkpoints");
        Arc::new(SqliteCheckpointStore::open(&path)?)
    } else {
        warn!("Checkpointing disabled; interrupted runs cannot be resumed by a later command");
        Arc::new(MemoryCheckpointStore::new())
    };

    let executor = Executor::new(&config.executor);
    let manager = RunManager::new(catalog, executor, store);

    match cli.command {
        Commands::Graphs => {
            for entry in manager.catalog().list() {
                println!("{:<20} {}", entry.name, entry.description);
            }
        }
        Commands::Graph { name } => {
            let graph = manager.catalog().get(&name)?;
            println!("{}", graph.to_mermaid());
            for finding in graph.diagnostics() {
                eprintln!("note: {}", finding);
            }
        }
        Commands::Run {
            graph,
            stream,
            question,
        } => {
            let text = if question.is_empty() {
                read_stdin()?
            } else {
                question.join(" ")
            };
            if text.trim().is_empty() {
                anyhow::bail!("no question given");
            }
            let run_id = RunId::new();
            let printer = stream.then(|| tokio::spawn(print_events(manager.stream(&run_id))));

            let run = manager.start_run_with_id(run_id.clone(), &graph, question_input(&text)?);
            tokio::pin!(run);
            let handle = tokio::select! {
                handle = &mut run => handle,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\n[cancelling run {}]", run_id);
                    manager.cancel(&run_id);
                    run.await
                }
            };
            let handle = match handle {
                Ok(handle) => handle,
                Err(e) => {
                    if let Some(printer) = printer {
                        printer.abort();
                    }
                    return Err(e.into());
                }
            };
            // The event stream ends with the run's terminal event.
            if let Some(printer) = printer {
                printer.await.ok();
            }
            report(&handle);
        }
        Commands::Resume { run_id, reply } => {
            let handle = manager
                .resume(&RunId::from_str(&run_id), &reply.join(" "))
                .await?;
            report(&handle);
        }
        Commands::Config | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    if let Some(path) = explicit {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".stepgraph").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => {
            eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create ~/.stepgraph/config.toml");
            create_env_config()
        }
    }
}

/// Minimal config from environment variables.
fn create_env_config() -> anyhow::Result<AppConfig> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    let base_url = std::env::var("OPENAI_BASE_URL").ok();
    if api_key.is_none() && base_url.is_none() {
        anyhow::bail!("no model configured: set OPENAI_API_KEY or provide a config file");
    }

    Ok(AppConfig {
        model: ModelConfig {
            provider: "openai".to_string(),
            model_id: std::env::var("STEPGRAPH_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key,
            base_url,
            azure_endpoint: None,
            azure_deployment: None,
            azure_api_version: None,
            max_tokens: 4096,
            temperature: 0.0,
            retry: None,
        },
        executor: Default::default(),
        checkpoint: None,
        agents: Default::default(),
    })
}

/// Copy of the config safe to print.
fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    if config.model.api_key.is_some() {
        config.model.api_key = Some("***".to_string());
    }
    config
}

fn read_stdin() -> anyhow::Result<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let lines = stdin.lock().lines().collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

async fn print_events(mut events: futures::stream::BoxStream<'static, GraphEvent>) {
    while let Some(event) = events.next().await {
        match event {
            GraphEvent::NodeCompleted { node, step, .. } => {
                eprintln!("[step {}: {}]", step, node);
            }
            GraphEvent::ToolStart { name, .. } => {
                eprintln!("[tool: {}]", name);
            }
            GraphEvent::ToolEnd { result, .. } => {
                let status = if result.is_error() { "ERROR" } else { "ok" };
                eprintln!("[{}: {}] {}", result.name, status, truncate(&result.content(), 200));
            }
            GraphEvent::FanOutDispatched { node, children, .. } => {
                eprintln!("[{}: {} parallel tasks]", node, children);
            }
            _ => {}
        }
    }
}

fn report(handle: &RunHandle) {
    let answer = handle
        .state
        .get_str("summary")
        .map(str::to_string)
        .or_else(|| handle.answer(HISTORY));

    match &handle.status {
        RunStatus::Completed => {
            println!("{}", answer.unwrap_or_default());
            eprintln!("\n[run {} completed in {} steps]", handle.run_id, handle.steps);
        }
        RunStatus::Interrupted { prompt, .. } => {
            if let Some(answer) = handle.answer(HISTORY) {
                println!("{}", answer);
            }
            eprintln!("\n{}", prompt);
            eprintln!("Reply with: stepgraph resume {} <reply>", handle.run_id);
        }
        RunStatus::Cancelled { node } => {
            if let Some(answer) = answer {
                println!("{}", answer);
            }
            eprintln!("\n[run {} cancelled at '{}' after {} steps]", handle.run_id, node, handle.steps);
        }
        RunStatus::Failed { error } => {
            eprintln!("[run {} failed: {}]", handle.run_id, error);
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
