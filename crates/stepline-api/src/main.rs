//! Stepline CLI and REST API entry point.
//!
//! Binary name: `stepline`
//!
//! Parses CLI arguments, initializes the database and services, then
//! dispatches to a command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { addr, otel } => {
            // The server gets the full subscriber stack, OTel included.
            if let Err(e) = stepline_observe::tracing_setup::init_tracing(*otel) {
                eprintln!("failed to initialize tracing: {e}");
            }

            let state = AppState::init().await?;
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;

            println!(
                "  {} Stepline API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            stepline_observe::tracing_setup::shutdown_tracing();
            println!("\n  Server stopped.");
        }

        Commands::Publish { file } => {
            init_cli_tracing(&cli);
            let state = AppState::init().await?;
            cli::definition::publish(&state, file, cli.json).await?;
        }

        Commands::Validate { file } => {
            // Offline: no database, no app state.
            init_cli_tracing(&cli);
            cli::definition::validate(file, cli.json)?;
        }
    }

    Ok(())
}

/// Plain fmt subscriber for the offline commands, filtered by verbosity.
fn init_cli_tracing(cli: &Cli) {
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepline=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
