use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use mediaflow_jobs::{PollConfig, StatusPoller};
use mediaflow_server::config::{self, AppConfig, Environment};
use mediaflow_server::{telemetry, HttpConfig, HttpServer, MediaflowClient, SubmitOptions};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Media ingestion server and job client
#[derive(Parser, Debug)]
#[command(name = "mediaflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server and the queue workers
    Serve(ServeArgs),

    /// Submit a job and follow it until it finishes
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (overrides MEDIAFLOW_BIND_ADDR)
    #[arg(short, long)]
    bind: Option<String>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Queue name, e.g. image-processing
    queue: String,

    /// Job type, e.g. upload
    job_type: String,

    /// JSON payload, or @path to read it from a file
    payload: String,

    /// Server base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Override the queue's attempt budget
    #[arg(long)]
    attempts: Option<u32>,

    /// Caller-chosen job id
    #[arg(long)]
    job_id: Option<String>,

    /// Return right after submission
    #[arg(long)]
    no_wait: bool,

    /// Status checks before giving up
    #[arg(long, default_value = "600")]
    max_polls: u32,
}

impl Cli {
    async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve(args) => serve(args).await,
            Commands::Submit(args) => submit(args).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    telemetry::init(&Environment::current());
    Cli::parse().execute().await
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = AppConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    info!(env = %Environment::current(), bind = %config.bind_addr, "Starting mediaflow");

    let ctx = mediaflow_server::build(&config).await?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("cannot listen on {}", config.bind_addr))?;

    HttpServer::new(ctx.clone(), HttpConfig::from(&config))?
        .serve(listener, shutdown_signal())
        .await?;

    ctx.shutdown(config.shutdown_grace()).await?;
    info!("mediaflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn read_payload(raw: &str) -> Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read payload file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

async fn submit(args: SubmitArgs) -> Result<()> {
    let payload = read_payload(&args.payload).await?;
    let client = MediaflowClient::new(&args.server)?;
    let options = SubmitOptions {
        attempts: args.attempts,
        job_id: args.job_id,
        ..SubmitOptions::default()
    };

    let accepted = client
        .submit(&args.queue, &args.job_type, &payload, &options)
        .await?;
    if args.no_wait {
        println!("{}", serde_json::to_string_pretty(&accepted)?);
        return Ok(());
    }

    let pb = ProgressBar::new(100);
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
    )?);
    pb.set_message(accepted.job_id.clone());
    pb.enable_steady_tick(Duration::from_millis(80));

    let poller = StatusPoller::with_config(
        &client,
        PollConfig {
            max_attempts: args.max_polls,
            ..PollConfig::default()
        },
    );
    let progress = pb.clone();
    let outcome = poller
        .wait_with_progress(&accepted.job_id, &accepted.status_url, move |p| {
            progress.set_position(u64::from(p))
        })
        .await;
    pb.finish_and_clear();

    match outcome {
        Ok(result) => {
            println!("{} {}", style("Job completed:").green().bold(), accepted.job_id);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", style("Job did not complete:").red().bold(), accepted.job_id);
            Err(e.into())
        }
    }
}
