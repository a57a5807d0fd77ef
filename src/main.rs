//! Agent runtime command-line entry point.
//!
//! - `schema`: print the configuration JSON schema
//! - `check`: validate a configuration file
//! - `servers`: start the configured servers once and report their capabilities
//! - `serve`: keep servers and the health monitor running until Ctrl-C

use agent_runtime::observability::init_tracing_with;
use agent_runtime::{Config, Runtime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agent-runtime", version, about = "Agent runtime tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the configuration JSON schema
    Schema,
    /// Validate a configuration file
    Check {
        #[arg(env = "AGENT_RUNTIME_CONFIG")]
        config: PathBuf,
    },
    /// Start every enabled server, print status and tools, then stop
    Servers {
        #[arg(env = "AGENT_RUNTIME_CONFIG")]
        config: PathBuf,
    },
    /// Run servers under the health monitor until interrupted
    Serve {
        #[arg(env = "AGENT_RUNTIME_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
        }
        Command::Check { config } => {
            let config = Config::from_path(&config)?;
            println!(
                "ok: {} servers, {} rules, default decision {:?}",
                config.servers.len(),
                config.security.rules.len(),
                config.security.default_decision
            );
        }
        Command::Servers { config } => {
            let config = Config::from_path(&config)?;
            init_tracing_with(&config.observability);
            let runtime = Runtime::new(config)?;
            runtime.servers().start_all().await;

            let servers = runtime.servers().servers().await;
            println!("{}", serde_json::to_string_pretty(&servers)?);
            for (server, tool) in runtime.servers().list_tools().await {
                println!("{}/{}: {}", server, tool.name, tool.description);
            }
            runtime.shutdown().await;
        }
        Command::Serve { config } => {
            let config = Config::from_path(&config)?;
            init_tracing_with(&config.observability);
            let runtime = Runtime::new(config)?;
            let running = runtime.start().await;
            tracing::info!(running, "serving; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            runtime.shutdown().await;
        }
    }
    Ok(())
}
