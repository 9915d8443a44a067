//! docrelay CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use docrelay_core::{TracingConfig, init_tracing};
use docrelay_protocol::ActionFilter;

use docrelay_client::cli::{AuthAction, Cli, Command, ConfigAction};
use docrelay_client::commands;
use docrelay_client::commands::server::ServerOptions;
use docrelay_client::config::ClientConfig;
use docrelay_client::error::ClientResult;
use docrelay_client::socket::SocketClient;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = if cli.debug {
        TracingConfig::cli_debug()
    } else if matches!(cli.command, Command::Server { .. }) {
        TracingConfig::daemon()
    } else {
        TracingConfig::default()
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };

    let client = SocketClient::new(
        config.socket_path(cli.socket_path.as_deref()),
        config.request_timeout(cli.timeout),
    );

    match cli.command {
        Command::Server {
            client_id,
            client_secret,
            no_browser,
        } => {
            let options = ServerOptions {
                client_id,
                client_secret,
                no_browser,
                socket_path: cli.socket_path,
            };
            commands::server::run(options, &config).await
        }
        Command::Auth { action } => match action {
            AuthAction::Login { wait } => {
                commands::auth::login(&client, Duration::from_secs(wait)).await
            }
            AuthAction::Status => commands::auth::status(&client).await,
            AuthAction::Logout => commands::auth::logout(&client).await,
        },
        Command::Schedule(args) => commands::actions::schedule(&client, &args).await,
        Command::Cancel { id } => commands::actions::cancel(&client, &id).await,
        Command::List {
            status,
            limit,
            json,
        } => {
            let filter = ActionFilter {
                status,
                limit,
            };
            commands::actions::list(&client, filter, json).await
        }
        Command::Watch { events } => commands::actions::watch(&client, events).await,
        Command::Status { json } => commands::status::run(&client, json).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
