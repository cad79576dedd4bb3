//! Kiln operator CLI.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_core::JobId;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln job queue operator CLI", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "KILN_CONFIG", default_value = "kiln.kdl")]
    config: PathBuf,

    /// Database URL used when the configuration names none
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        /// Job type
        job_type: String,
        /// Channel the job is routed to
        #[arg(long)]
        channel: String,
        /// JSON arguments
        #[arg(long, default_value = "null")]
        args: String,
        /// Jobs that must finish first
        #[arg(long = "after")]
        dependencies: Vec<JobId>,
    },
    /// Show a job as JSON
    Show {
        /// Job ID
        id: JobId,
    },
    /// List jobs nothing depends on
    Roots,
    /// Ask a job to stop
    Cancel {
        /// Job ID
        id: JobId,
    },
    /// Delete a root job and the dependencies only it needs
    Delete {
        /// Job ID
        id: JobId,
    },
    /// Requeue expired leases once
    Sweep,
    /// Run the lease sweeper until interrupted
    Serve,
    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate = cli.command {
        return commands::validate(&cli.config);
    }

    let config = kiln_config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    commands::init_tracing(&config.log);

    let queue = commands::open_queue(&config.store, cli.database_url).await?;

    let result = match cli.command {
        Commands::Enqueue {
            job_type,
            channel,
            args,
            dependencies,
        } => commands::jobs::enqueue(&queue, job_type, channel, &args, dependencies).await,
        Commands::Show { id } => commands::jobs::show(&queue, id).await,
        Commands::Roots => commands::jobs::roots(&queue).await,
        Commands::Cancel { id } => commands::jobs::cancel(&queue, id).await,
        Commands::Delete { id } => commands::jobs::delete(&queue, id).await,
        Commands::Sweep => commands::lease::sweep(&queue, &config.lease).await,
        Commands::Serve => commands::lease::serve(&queue, &config.lease).await,
        Commands::Validate => Ok(()),
    };

    queue.close().await?;
    result
}
