//! AgentLink terminal front end
//!
//! Hosts the agent worker from a terminal: starts the supervisor, drives the
//! typed client, and stops the worker on the way out.

use agentlink_core::{
    AgentClient, AgentConfig, ExecuteCommandParams, Supervisor, WebviewMessage, WorkerStatus,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "agentlink", version, about = "Talk to an AI agent worker over JSON-RPC")]
struct Cli {
    /// Path to the agent configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat; one message per line, `/new` opens a fresh panel
    Chat,
    /// Run a worker command, e.g. `agentlink command cody.explain '"src/main.rs"'`
    Command {
        name: String,
        /// Arguments as JSON; anything that does not parse is sent as a string
        args: Vec<String>,
    },
    /// Start the worker, print its handshake details, and stop it
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::resolve(cli.config.as_deref()).context("Failed to load agent configuration")?;
    info!("Using agent command: {}", config.command);

    let supervisor = Arc::new(Supervisor::with_process_launcher(config));
    let client = AgentClient::new(Arc::clone(&supervisor));

    supervisor.start().await.context("Failed to start agent worker")?;

    let outcome = match cli.command {
        Command::Chat => run_chat(&client).await,
        Command::Command { name, args } => run_command(&client, name, &args).await,
        Command::Status => print_status(&supervisor),
    };

    supervisor.stop().await;
    outcome
}

async fn run_chat(client: &AgentClient) -> Result<()> {
    let mut panel = client.chat_new().await.context("Failed to open chat panel")?;
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout.write_all(b"> ").await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/new" => {
                panel = client.chat_new().await.context("Failed to open chat panel")?;
                stdout.write_all(b"(new chat)\n").await?;
            }
            text => match client.chat_submit_message(&panel, WebviewMessage::submit(text)).await {
                Ok(reply) => {
                    let text = reply
                        .last_reply()
                        .and_then(|message| message.display_text.clone().or_else(|| message.text.clone()))
                        .unwrap_or_default();
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    if let Some(error) = reply.last_reply().and_then(|m| m.error.as_ref()) {
                        warn!("Chat reply carried an error: {}", error.message);
                    }
                }
                Err(e) if e.is_retryable() => {
                    // The panel belonged to a worker that is gone; try again on a fresh one
                    warn!("Chat message failed, retry later: {}", e);
                    if client.status() == WorkerStatus::Running {
                        panel = client.chat_new().await.context("Failed to reopen chat panel")?;
                    }
                }
                Err(e) => return Err(e.into()),
            },
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run_command(client: &AgentClient, name: String, args: &[String]) -> Result<()> {
    let params = ExecuteCommandParams {
        command: name,
        arguments: args.iter().map(String::as_str).map(parse_argument).collect(),
    };
    let result = client.execute_command(params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_status(supervisor: &Supervisor) -> Result<()> {
    let connection = supervisor
        .connection()
        .context("Worker is not connected")?;
    let info = connection.server_info();

    println!("status:     {}", supervisor.current_status());
    println!("generation: {}", connection.generation());
    println!("instance:   {}", connection.instance_id());
    println!(
        "pid:        {}",
        connection.pid().map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "server:     {} {}",
        info.name,
        info.version.as_deref().unwrap_or("")
    );
    if let Some(version) = info.protocol_version {
        println!("protocol:   {}", version);
    }
    if let Some(authenticated) = info.authenticated {
        println!("signed in:  {}", authenticated);
    }
    println!("started:    {}", connection.started_at().to_rfc3339());
    Ok(())
}

fn parse_argument(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
