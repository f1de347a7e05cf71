//! `audiokeep` entry point.

use clap::Parser;

use audiokeep_cli::{Cli, CliError, Commands, handlers, settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    settings::init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        let code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
        eprintln!("Error: {e:#}");
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = settings::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Simulate(args) => handlers::simulate::execute(&config, &args).await,
        Commands::Host { seconds, json } => handlers::host::execute(&config, seconds, json).await,
        Commands::Config => handlers::config::execute(&config),
    }
}
