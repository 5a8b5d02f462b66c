mod builtin;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chat_core::Config;
use clap::{Parser, Subcommand};
use colored::Colorize;
use context_manager::ConversationTree;
use extension_system::{ExtensionHost, ExtensionLoader, HookDispatcher, ToolRegistry};
use pipeline_system::stages::{KeywordKnowledgeBase, OpenAiChatClient};
use pipeline_system::CancellationToken;
use serde_json::Value;
use session_manager::{ConversationService, TurnOutcome};
use storage_manager::FileStorage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "branch-cli")]
#[command(about = "Branching conversations from the command line")]
#[command(version)]
struct Cli {
    /// Config file (JSON or TOML); defaults to ~/.branchtale/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding conversation data
    #[arg(long, global = true, env = "BRANCHTALE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Keyword knowledge base (JSON array of {title, keywords, content})
    #[arg(long, global = true)]
    knowledge: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open (or create) the conversation for an owner
    New {
        owner: String,
        /// System message framing the conversation
        #[arg(long)]
        system: Option<String>,
    },
    /// Send one message
    Send {
        tree: String,
        message: String,
        /// Reply to this turn instead of the current one
        #[arg(long)]
        parent: Option<String>,
    },
    /// Interactive chat on the current branch
    Chat { tree: String },
    /// Make another turn current
    Switch { tree: String, turn: String },
    /// Delete a turn and everything below it
    Delete { tree: String, turn: String },
    /// Show the active branch
    History { tree: String },
    /// Show every turn as a tree
    Tree { tree: String },
    /// Show the resolved variables at a turn
    State { tree: String, turn: Option<String> },
    /// Show storage statistics and chain validation for a turn
    Stats { tree: String, turn: Option<String> },
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

async fn build_service(cli: &Cli, config: &Config) -> anyhow::Result<ConversationService> {
    let mut loader = ExtensionLoader::new();
    builtin::register(&mut loader);
    let host = Arc::new(ExtensionHost::new(loader, Arc::new(ToolRegistry::new())));
    host.load(builtin::core_tools_manifest(), Value::Null).await?;
    host.enable(builtin::CORE_TOOLS_ID).await?;
    let dispatcher =
        Arc::new(HookDispatcher::new(host).with_annotations(config.extensions.annotate_errors));

    let knowledge = match &cli.knowledge {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            KeywordKnowledgeBase::from_json(&json)
                .with_context(|| format!("invalid knowledge base {}", path.display()))?
        }
        None => KeywordKnowledgeBase::new(Vec::new()),
    };

    let storage = Arc::new(FileStorage::new(&config.data_dir));
    let service = ConversationService::from_config(
        config,
        storage,
        dispatcher,
        Arc::new(knowledge),
        Arc::new(OpenAiChatClient::new()),
    )?;
    Ok(service)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    tracing::debug!(data_dir = %config.data_dir.display(), model = %config.model.model, "branch-cli: starting");
    let service = build_service(&cli, &config).await?;

    match &cli.command {
        Commands::New { owner, system } => {
            let tree = service.open_conversation(owner, system.as_deref()).await?;
            println!("{}", format!("Tree: {}", tree.id).green());
        }
        Commands::Send {
            tree,
            message,
            parent,
        } => {
            let outcome = send(&service, tree, parent.as_deref(), message).await?;
            print_outcome(&outcome);
        }
        Commands::Chat { tree } => run_chat(&service, tree).await?,
        Commands::Switch { tree, turn } => {
            let switch = service
                .switch_branch(tree, turn)
                .await?
                .with_context(|| format!("turn {turn} not found in tree {tree}"))?;
            if switch.repaired {
                println!("{}", "State chain was repaired".yellow());
            }
            println!("{}", format!("Current turn: {turn}").green());
            println!("{}", Value::Object(switch.state).to_string().dimmed());
        }
        Commands::Delete { tree, turn } => {
            let updated = service
                .delete_turn(tree, turn)
                .await?
                .with_context(|| format!("cannot delete turn {turn} from tree {tree}"))?;
            println!(
                "{}",
                format!(
                    "Deleted. {} turns left, current turn: {}",
                    updated.turns.len(),
                    updated.current_turn_id
                )
                .green()
            );
        }
        Commands::History { tree } => {
            let path = service
                .active_path(tree)
                .await?
                .with_context(|| format!("tree {tree} not found"))?;
            for turn in path.iter().filter(|turn| !turn.is_root()) {
                println!("{}", format!("[{}]", turn.id).dimmed());
                if turn.user_input.is_empty() {
                    println!("{}", format!("(system) {}", turn.response).magenta());
                } else {
                    println!("{}", format!("> {}", turn.user_input).cyan());
                    println!("{}", turn.response);
                }
                println!();
            }
        }
        Commands::Tree { tree } => {
            let tree = service
                .store()
                .get_tree(tree)
                .await?
                .with_context(|| format!("tree {tree} not found"))?;
            print_subtree(&tree, tree.root_id(), 0);
        }
        Commands::State { tree, turn } => {
            let turn = resolve_turn(&service, tree, turn.as_deref()).await?;
            let state = service
                .state_at(tree, &turn)
                .await?
                .with_context(|| format!("turn {turn} not found in tree {tree}"))?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(state))?);
        }
        Commands::Stats { tree, turn } => {
            let turn = resolve_turn(&service, tree, turn.as_deref()).await?;
            let stats = service
                .statistics(tree, &turn)
                .await?
                .with_context(|| format!("turn {turn} not found in tree {tree}"))?;
            println!("turns on path:     {}", stats.total_nodes);
            println!("snapshots:         {}", stats.snapshot_count);
            println!("diffs:             {}", stats.diff_count);
            println!("compression ratio: {:.2}", stats.compression_ratio);
            if let Some(report) = service.validate(tree, &turn).await? {
                if report.is_valid {
                    println!("{}", "state chain:       valid".green());
                } else {
                    println!(
                        "{}",
                        format!(
                            "state chain:       broken at {} ({:?})",
                            report.broken_at.unwrap_or_default(),
                            report.issue
                        )
                        .red()
                    );
                }
            }
        }
    }

    Ok(())
}

async fn resolve_turn(
    service: &ConversationService,
    tree_id: &str,
    turn: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(turn) = turn {
        return Ok(turn.to_string());
    }
    let tree = service
        .store()
        .get_tree(tree_id)
        .await?
        .with_context(|| format!("tree {tree_id} not found"))?;
    Ok(tree.current_turn_id)
}

/// Send a message; Ctrl-C cancels the run before its next stage.
async fn send(
    service: &ConversationService,
    tree_id: &str,
    parent: Option<&str>,
    message: &str,
) -> anyhow::Result<TurnOutcome> {
    let cancel = CancellationToken::new();
    let run = service.send_message(tree_id, parent, message, &cancel);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling after the current stage...".yellow());
            cancel.cancel();
            run.await
        }
    };
    result?.with_context(|| format!("tree {tree_id} or its parent turn was not found"))
}

async fn run_chat(service: &ConversationService, tree_id: &str) -> anyhow::Result<()> {
    println!("{}", "Type a message, /switch <turn> to change branch, /quit to exit".dimmed());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(turn) = line.strip_prefix("/switch ") {
            match service.switch_branch(tree_id, turn.trim()).await? {
                Some(_) => println!("{}", format!("Current turn: {}", turn.trim()).green()),
                None => println!("{}", "No such turn".red()),
            }
            continue;
        }

        match send(service, tree_id, None, line).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(error) => println!("{}", format!("Error: {error:#}").red()),
        }
    }
    Ok(())
}

fn print_outcome(outcome: &TurnOutcome) {
    if let Some(reasoning) = &outcome.reasoning {
        println!("{}", reasoning.dimmed());
    }
    println!("{}", outcome.response);
    for (index, prompt) in outcome.next_prompts.iter().enumerate() {
        println!("{}", format!("  {}. {}", index + 1, prompt).yellow());
    }
    for event in &outcome.events {
        println!("{}", format!("  [event] {event}").magenta());
    }
    for failure in &outcome.hook_failures {
        println!(
            "{}",
            format!("  [extension error] {}: {}", failure.source, failure.error).red()
        );
    }
    println!(
        "{}",
        format!(
            "[{}] {}",
            outcome.turn_id,
            Value::Object(outcome.variables.clone())
        )
        .dimmed()
    );
}

fn print_subtree(tree: &ConversationTree, turn_id: &str, depth: usize) {
    if let Some(turn) = tree.get(turn_id) {
        let marker = if turn.id == tree.current_turn_id { "*" } else { " " };
        let label = if turn.is_root() {
            "(root)".to_string()
        } else if turn.user_input.is_empty() {
            "(system)".to_string()
        } else {
            turn.user_input.chars().take(48).collect()
        };
        println!("{}{} {} {}", "  ".repeat(depth), marker, turn.id.dimmed(), label);
    }
    for child in tree.children_of(turn_id) {
        print_subtree(tree, &child.id, depth + 1);
    }
}
