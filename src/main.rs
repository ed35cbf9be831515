//! aicli binary entry point.

use aicli::cli::{commands, Cli, Commands};
use clap::Parser;

fn init_tracing(verbose: u8) {
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());

    // `-v` turns on our own debug logs without needing target names; `-vv`
    // opens everything. `RUST_LOG` directives still apply on top.
    let directive = match verbose {
        0 => None,
        1 => Some("aicli=debug"),
        _ => Some("debug"),
    };
    if let Some(parsed) = directive.and_then(|d| d.parse().ok()) {
        env_filter = env_filter.add_directive(parsed);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Chat(args) => commands::run_chat(config, args).await,
        Commands::Ask(args) => commands::run_ask(config, args).await,
        Commands::Configure(args) => commands::run_configure(config, args),
        Commands::Status => commands::run_status(config).await,
        Commands::Tunnel => commands::run_tunnel(config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
