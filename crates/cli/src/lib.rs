pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "procura",
    about = "Procura operator CLI",
    long_about = "Operate the Procura approval runtime: database migrations, config inspection, and journaled workflow instances.",
    after_help = "Examples:\n  procura migrate\n  procura config\n  procura instances --kind purchase_approval --all"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "List journaled workflow instances")]
    Instances {
        #[arg(long, help = "Only list instances of this workflow kind")]
        kind: Option<String>,
        #[arg(long, help = "Include instances that already completed")]
        all: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Instances { kind, all } => commands::instances::run(kind.as_deref(), all),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
