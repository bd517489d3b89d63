use clap::{Parser, Subcommand};
use fleet_core::config::FleetConfig;

mod app;

#[derive(Debug, Parser)]
#[command(name = "fleet-server", version, about = "Cron scheduler and remote script runner")]
struct Cli {
    /// Config file (default: ~/.fleet/fleet.toml)
    #[arg(long, env = "FLEET_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore enabled schedules and run until Ctrl-C (default)
    Serve,
    /// Print the registered executors
    Executors,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config / FLEET_CONFIG > ~/.fleet/fleet.toml
    let config = FleetConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.filter.as_str().into()),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => app::serve(config).await,
        Command::Executors => {
            let app = app::App::build(&config)?;
            for executor in app.scheduler.executors() {
                println!("{:<12} {}", executor.name, executor.display_name);
            }
            app.shutdown();
            Ok(())
        }
    }
}
