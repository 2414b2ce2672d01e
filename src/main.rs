use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use coderag::config::Config;
use coderag::indexer::IndexOptions;
use coderag::mcp::server::{McpContext, McpServer};
use coderag::retrieval::{QueryEvent, QueryMode, QueryRequest, RetrieveOptions, run_query};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// coderag - index a source tree and answer questions about it
#[derive(Parser, Debug)]
#[command(name = "coderag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON config file (default: config.json)
    #[arg(short, long, global = true, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve index and query tools over MCP (stdio)
    Serve,

    /// Index a source directory
    Index {
        /// Root of the source tree
        directory: String,

        /// Drop the whole index first
        #[arg(long)]
        reset: bool,

        /// Only index files of this language
        #[arg(short, long)]
        language: Option<String>,

        /// Re-chunk files even if unchanged
        #[arg(long)]
        force: bool,
    },

    /// Ask a question; events are printed as JSON lines
    Query {
        /// Question about the codebase
        question: Option<String>,

        /// Restrict primary results to one language
        #[arg(short, long)]
        language: Option<String>,

        /// Fuse keyword and vector ranking
        #[arg(long)]
        hybrid: bool,

        /// Number of primary results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Pull in one hop of referenced/referencing classes
        #[arg(long)]
        expand: bool,

        /// Show one class and its reference neighbourhood
        #[arg(long, conflicts_with = "template_deps")]
        class_lookup: Option<String>,

        /// Resolve the classes a template refers to
        #[arg(long)]
        template_deps: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries MCP frames and JSON output; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("Failed to load config")?;
    config.validate()?;
    // `index --reset` is the way out of a vector size change.
    let rebuild_store = matches!(cli.command, Commands::Index { reset: true, .. });
    let ctx = McpContext::open(config, rebuild_store)?;

    match cli.command {
        Commands::Serve => {
            info!("Starting coderag MCP Server...");
            McpServer::new(ctx).start().await?;
        }
        Commands::Index {
            directory,
            reset,
            language,
            force,
        } => {
            let options = IndexOptions {
                reset,
                language,
                force,
            };
            let report = ctx
                .indexer
                .index_directory(&directory, &options)
                .await
                .with_context(|| format!("Failed to index {directory}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Query {
            question,
            language,
            hybrid,
            top_k,
            expand,
            class_lookup,
            template_deps,
        } => {
            let mode = match (class_lookup, template_deps) {
                (Some(name), _) => QueryMode::ClassLookup(name),
                (None, Some(name)) => QueryMode::TemplateDeps(name),
                (None, None) => QueryMode::Ask,
            };
            let question = question.unwrap_or_default();
            if mode == QueryMode::Ask && question.trim().is_empty() {
                bail!("a question is required unless --class-lookup or --template-deps is given");
            }

            let request = QueryRequest {
                question,
                mode,
                options: RetrieveOptions {
                    language,
                    hybrid,
                    top_k,
                    expand_dependencies: expand.then_some(true),
                    budget_tokens: None,
                },
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                let mut failed = false;
                while let Some(event) = rx.recv().await {
                    failed |= matches!(event, QueryEvent::Error(_));
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                failed
            });

            run_query(&ctx.retriever, ctx.generator.clone(), &request, &tx).await;
            drop(tx);
            if printer.await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
