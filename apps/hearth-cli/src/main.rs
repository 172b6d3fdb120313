use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::{ClientArgs, HubClient, QueueCmd, RestartArgs, ServiceCmd, StatusArgs};

#[derive(Parser)]
#[command(name = "hearthctl", version, about = "Operate a hearth hub")]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate health and every supervised service
    Status(StatusArgs),
    /// Pending change set
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },
    /// Lifecycle and logs of one service
    Service {
        #[command(subcommand)]
        cmd: ServiceCmd,
    },
    /// Full-system restart, followed until it settles
    Restart(RestartArgs),
}

fn run(cli: Cli) -> Result<()> {
    let client = HubClient::from_args(&cli.client)?;
    match cli.command {
        Commands::Status(args) => commands::status::run(&client, &args),
        Commands::Queue { cmd } => commands::queue::execute(&client, cmd),
        Commands::Service { cmd } => commands::service::execute(&client, cmd),
        Commands::Restart(args) => commands::restart::run(&client, &args),
    }
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
