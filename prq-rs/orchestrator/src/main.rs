use anyhow::Result;
use clap::{Parser, Subcommand};

use prq::constants::DEFAULT_PRIORITY;
use prq::telemetry;

mod commands;

use commands::{job_show, run_worker, submit_job};

#[derive(Parser)]
#[command(name = "prq")]
#[command(version)]
#[command(about = "Priority and delayed job queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and print its ID
    Submit {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        queue: String,
        #[arg(long, default_value_t = DEFAULT_PRIORITY, allow_negative_numbers = true)]
        priority: i64,
        #[arg(long)]
        delay_seconds: Option<f64>,
        /// JSON payload handed to the handler
        #[arg(long)]
        payload: Option<String>,
    },
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    Show {
        job_id: String,
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Run {
        #[arg(long)]
        config: Option<String>,
        #[arg(long, action = clap::ArgAction::Append)]
        queue: Vec<String>,
    },
}

async fn dispatch_command(command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            config,
            queue,
            priority,
            delay_seconds,
            payload,
        } => {
            submit_job(commands::SubmitArgs {
                config,
                queue,
                priority,
                delay_seconds,
                payload,
            })
            .await?;
        }
        Commands::Job { command } => match command {
            JobCommand::Show { job_id, config } => {
                job_show(job_id, config).await?;
            }
        },
        Commands::Worker { command } => match command {
            WorkerCommand::Run { config, queue } => {
                run_worker(config, queue).await?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    dispatch_command(cli.command).await
}
