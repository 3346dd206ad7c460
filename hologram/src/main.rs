//! Claudex Hologram Entry Point
//!
//! Short-lived command-line front end. Each invocation reads the markers,
//! talks to (or starts) the sidecar, prints its answer on stdout and exits.
//! Logs go to stderr.

use clap::{Parser, Subcommand};
use claudex_hologram::{
    persist_live_scores, query_with_fallback, rescore_with_fallback, FallbackInputs,
    HologramConfig, QueryRequest, ScoringClient,
};
use claudex_memory::{PersistedScoreReader, PressureStore};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "claudex-hologram")]
#[command(about = "Hologram scoring sidecar client")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to $CLAUDEX_CONFIG or ~/.claudex/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sidecar if needed and print its port
    Start,
    /// Stop the sidecar, forcefully if it ignores SIGTERM
    Stop,
    /// Show marker state and whether the sidecar answers
    Status,
    /// Exit 0 if the sidecar answers a ping
    Ping,
    /// Ask the sidecar to exit over the protocol
    Shutdown,
    /// Score files for a prompt, falling back to persisted scores or recency
    Query {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = 0)]
        turn: u64,
        #[arg(long)]
        session: String,
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Recently touched file to bias scoring toward (repeatable)
        #[arg(long = "boost")]
        boost_files: Vec<String>,
        /// Recently touched file used when no scores exist (repeatable)
        #[arg(long = "recent")]
        recent_files: Vec<String>,
        /// Persisted-score scope (defaults to the project dir)
        #[arg(long)]
        scope: Option<String>,
    },
    /// Ask the sidecar to refresh scores for a session
    Rescore {
        #[arg(long)]
        session: String,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Tell the sidecar which files changed
    Notify {
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Serialize)]
struct StatusReport {
    running: bool,
    pid: Option<u32>,
    port: Option<u16>,
    responding: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claudex_hologram=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match HologramConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    run(args.command, ScoringClient::new(config)).await
}

async fn run(command: Command, client: ScoringClient) -> ExitCode {
    match command {
        Command::Start => match client.lifecycle().start().await {
            Ok(port) => {
                println!("{port}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Command::Stop => {
            let outcome = client.lifecycle().stop().await;
            println!("{}", outcome.as_str());
            ExitCode::SUCCESS
        }
        Command::Status => {
            let markers = client.lifecycle().markers();
            let report = StatusReport {
                running: client.lifecycle().is_running(),
                pid: markers.read_pid(),
                port: markers.read_port(),
                responding: client.ping().await,
            };
            print_json(&report)
        }
        Command::Ping => {
            if client.ping().await {
                println!("pong");
                ExitCode::SUCCESS
            } else {
                println!("no response");
                ExitCode::FAILURE
            }
        }
        Command::Shutdown => {
            if client.shutdown().await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Query {
            prompt,
            turn,
            session,
            project_dir,
            boost_files,
            recent_files,
            scope,
        } => {
            let scope = scope.or_else(|| project_dir.as_ref().map(|d| d.display().to_string()));
            let mut request = QueryRequest::new(prompt, turn, session).with_boost_files(boost_files);
            request.project_dir = project_dir;

            let store = open_store(&client);
            let inputs = FallbackInputs {
                recent_files: &recent_files,
                reader: store.as_ref().map(|s| s as &dyn PersistedScoreReader),
                project_scope: scope.as_deref(),
            };
            let result = query_with_fallback(&client, &request, inputs).await;
            tracing::info!(source = result.source.as_str(), hot = result.hot.len(), warm = result.warm.len(), "Query complete");

            if let Some(store) = &store {
                let max_age = client.config().store.max_age();
                if let Err(e) = persist_live_scores(store, scope.as_deref(), &result, max_age) {
                    tracing::warn!("Failed to persist scores: {}", e);
                }
            }
            print_json(&result)
        }
        Command::Rescore { session, scope } => {
            let store = open_store(&client);
            let reader = store.as_ref().map(|s| s as &dyn PersistedScoreReader);
            let outcome = rescore_with_fallback(&client, &session, reader, scope.as_deref()).await;
            print_json(&outcome)
        }
        Command::Notify { files } => {
            client.notify_file_changes(&files).await;
            ExitCode::SUCCESS
        }
    }
}

fn open_store(client: &ScoringClient) -> Option<PressureStore> {
    let path = client.config().pressure_file();
    match PressureStore::open(&path) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Persisted scores unavailable: {}", e);
            None
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Failed to encode output: {}", e);
            ExitCode::FAILURE
        }
    }
}
