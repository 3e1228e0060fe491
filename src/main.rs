use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use culprit::config::JobConfig;
use culprit::job::Job;
use culprit::server::{self, ServerType};

#[derive(Parser)]
#[command(name = "culprit")]
#[command(version, about = "Parallel git bisection of containerised services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bisect issues, exposing each running system to judges over a server
    Serve {
        /// Path to the job configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Number of concurrent replicas, one per issue
        #[arg(short, long, default_value = "1")]
        replicas: usize,

        /// Port to serve judges on
        #[arg(short, long, default_value = "40032")]
        port: u16,

        /// Server flavour
        #[arg(long, value_enum, default_value = "http")]
        server_type: ServerKind,

        /// Append-only backup of skipped (broken) commits
        #[arg(long, default_value = "replacements.log")]
        replacements_backup: PathBuf,
    },
    /// Run a single commit by its offset behind the bad commit
    Run {
        /// Path to the job configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Offset behind the bad commit (0 is the bad commit itself)
        #[arg(short, long)]
        offset: usize,

        /// Append-only backup of skipped (broken) commits
        #[arg(long, default_value = "replacements.log")]
        replacements_backup: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServerKind {
    Http,
    Websocket,
}

impl From<ServerKind> for ServerType {
    fn from(kind: ServerKind) -> Self {
        match kind {
            ServerKind::Http => ServerType::Http,
            ServerKind::Websocket => ServerType::Websocket,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, replicas, port, server_type, replacements_backup } => {
            cmd_serve(&config, replicas, port, server_type.into(), replacements_backup).await
        }
        Commands::Run { config, offset, replacements_backup } => {
            cmd_run(&config, offset, replacements_backup).await
        }
    }
}

async fn cmd_serve(
    config_path: &std::path::Path,
    replicas: usize,
    port: u16,
    server_type: ServerType,
    replacements_backup: PathBuf,
) -> Result<()> {
    let config = JobConfig::from_path(config_path)?;
    let mut job = Job::from_config(config)?;
    job.replicas_count = replicas;
    job.replacements_backup = replacements_backup;

    let (rs_rx, oc_rx) = job.run().await.context("Failed to start job")?;

    let server = server::serve(server_type, port, rs_rx, oc_rx);
    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[job] interrupted, stopping");
        }
    }

    job.stop().await
}

async fn cmd_run(
    config_path: &std::path::Path,
    offset: usize,
    replacements_backup: PathBuf,
) -> Result<()> {
    let config = JobConfig::from_path(config_path)?;
    let mut job = Job::from_config(config)?;
    job.replicas_count = 0;
    job.replacements_backup = replacements_backup;

    let _channels = job.run().await.context("Failed to initialize job")?;
    let system = job.run_commit_by_offset(offset).await?;

    let mut ports: Vec<_> = system.ports.iter().collect();
    ports.sort();
    for (container_port, host_port) in ports {
        println!("{} -> {}", container_port, host_port);
    }
    eprintln!("[job] commit at offset {} is up; Ctrl-C to release", offset);

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    system.done();
    job.stop().await
}
