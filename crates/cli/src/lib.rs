pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::logs::LogsArgs;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    about = "Warden operator CLI",
    long_about = "Operate the Warden event log and threat classification worker: migrations, readiness checks, config inspection, log queries and one-shot classification.",
    after_help = "Examples:\n  warden doctor --json\n  warden logs --session abc-123 --order asc\n  warden logs --stats\n  warden classify"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Check config, database connectivity and classifier reachability")]
    Doctor {
        #[arg(long, help = "Emit the full machine-readable report")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Query the event log with filters and pagination")]
    Logs(LogsArgs),
    #[command(about = "Classify every finished, unclassified session once")]
    Classify,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Config => commands::config::run(),
        Command::Logs(args) => commands::logs::run(args),
        Command::Classify => commands::classify::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
