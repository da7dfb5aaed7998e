use crate::demo::{print_status_catalog, run_demo, DemoArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use tenant_repairs::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Damage Report Desk",
    about = "Run the damage report service or walk a repair ticket through its lifecycle",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service with health, readiness and metrics endpoints (default command)
    Serve(ServeArgs),
    /// List ticket statuses with their labels and comment requirements
    Statuses,
    /// Walk one damage report from creation to rating against the in-memory store
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Statuses => print_status_catalog(),
        Command::Demo(args) => run_demo(args).await,
    }
}
