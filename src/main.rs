//! sessionbox - session-scoped container sandboxes with an HTTP API.
//!
//! Usage:
//!   sessionbox serve [--port 8000]                          # Start HTTP server
//!   sessionbox run --session s1 --language python a.py b.py # Run files once

use clap::{Parser, Subcommand};
use sessionbox::http_server::{self, AppState};
use sessionbox::{
    CodeBlock, DockerEngine, ExecutionRequest, IdleReaper, Language, Orchestrator, ReaperConfig,
    SandboxConfig, SessionKey, SessionRegistry,
};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sessionbox")]
#[command(about = "Session-scoped container sandboxes with an HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    sandbox: SandboxConfig,

    #[command(flatten)]
    reaper: ReaperConfig,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,
    },
    /// Run local files as consecutive blocks in a session sandbox
    Run {
        /// Session the sandbox belongs to
        #[arg(long, default_value = "cli")]
        session: String,

        /// Language every file is run with
        #[arg(long, default_value = "python")]
        language: String,

        /// Leave the sandbox running afterwards
        #[arg(long)]
        keep: bool,

        /// Source files, run in the given order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = args.sandbox.memory_bytes() {
        eprintln!("Error: {}", e);
        exit(2);
    }

    let engine = match DockerEngine::connect() {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };
    let registry = Arc::new(SessionRegistry::new(engine, args.sandbox));
    let orchestrator = Orchestrator::new(registry.clone());

    match args.command {
        Commands::Serve { port } => {
            IdleReaper::new(registry, args.reaper).spawn();
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
            };
            if let Err(e) = http_server::run_server(port, AppState { orchestrator }, shutdown).await
            {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run {
            session,
            language,
            keep,
            files,
        } => {
            let language = Language::parse(&language);
            let mut code_blocks = Vec::with_capacity(files.len());
            for path in &files {
                match tokio::fs::read_to_string(path).await {
                    Ok(code) => code_blocks.push(CodeBlock {
                        code,
                        language: language.clone(),
                        files: None,
                    }),
                    Err(e) => {
                        eprintln!("Error: {}: {}", path.display(), e);
                        exit(1);
                    }
                }
            }

            let request = ExecutionRequest {
                key: SessionKey::session(session.clone()),
                code_blocks,
            };
            let outcome = orchestrator.handle(&request).await;
            if !keep {
                if let Err(e) = orchestrator.kill(&session).await {
                    error!(session = %session, error = %e, "Failed to stop sandbox");
                }
            }

            match outcome {
                Ok(result) => {
                    print!("{}", result.console);
                    if !result.output.is_empty() {
                        eprintln!("--- output ---");
                        print!("{}", result.output);
                    }
                    exit(i32::try_from(result.exit_code).unwrap_or(1));
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
