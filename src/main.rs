use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use query_master::client::{QueryControlClient, QueryReport};
use query_master::config::{filter_directive, ClientConfig, MasterConfig};
use query_master::server::MasterServer;
use query_master::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "query-master")]
#[command(version)]
#[command(about = "A query scheduler: a master dispatching queries to workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the master
    Master(MasterArgs),

    /// Submit a query and follow it until it finishes
    Query(QueryArgs),
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Path to the master TOML config
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct QueryArgs {
    /// Path to the query control TOML config
    config: PathBuf,

    /// Query file, as the workers should open it
    query_file: PathBuf,

    /// Priority (lower runs first)
    #[arg(value_parser = clap::value_parser!(i32).range(0..))]
    priority: i32,

    /// Output format for the final report
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(filter_directive(level))),
        )
        .init();
}

// =============================================================================
// Master
// =============================================================================

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = MasterConfig::from_file(&args.config)?;
    init_tracing(&config.log_level);

    tracing::info!(
        config = %args.config.display(),
        port = config.listen_port,
        algorithm = %config.scheduling_algorithm,
        aging_interval_ms = config.aging_interval_ms,
        "Starting master"
    );

    let shutdown = install_shutdown_handler()?;
    let server = MasterServer::bind(("0.0.0.0", config.listen_port), config).await?;
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Query control
// =============================================================================

async fn run_query(args: QueryArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let config = ClientConfig::from_file(&args.config)?;
    init_tracing(&config.log_level);

    let client = QueryControlClient::new(config);
    let report = client.run(&args.query_file, args.priority).await?;
    print_report(&report, &args.output)?;
    Ok(report.succeeded())
}

fn print_report(
    report: &QueryReport,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("Query Report");
            println!("{}", "=".repeat(40));
            let id = report
                .query_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("ID:       {}", id);
            println!("Path:     {}", report.path);
            println!("Priority: {}", report.priority);
            println!("Outcome:  {}", report.outcome);
            if !report.reads.is_empty() {
                println!();
                println!("{:<20} CONTENT", "FILE");
                println!("{}", "-".repeat(40));
                for read in &report.reads {
                    println!("{:<20} {}", read.origin, read.content);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Master(master_args) => {
            run_master(master_args).await?;
        }
        Commands::Query(query_args) => {
            if !run_query(query_args).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
