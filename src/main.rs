use std::env;
use std::io;
use std::process::ExitCode;

use credit_ledger::csv::{read_commands, write_accounts};
use credit_ledger::{Dispatcher, LedgerConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        error!("usage: credit-ledger <commands.csv> [config.toml]");
        return ExitCode::from(2);
    };

    let config = match args.next() {
        Some(config_path) => match LedgerConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                return ExitCode::from(2);
            }
        },
        None => LedgerConfig::default(),
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let commands = match read_commands(path.clone()) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = match Dispatcher::from_config(&config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.send(command).await.is_err() {
                        // dispatcher stopped on a store failure
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    if let Err(e) = dispatcher.run(ReceiverStream::new(cmd_receiver)).await {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let accounts = dispatcher.accounts().await;
    if let Err(e) = write_accounts(io::stdout().lock(), &accounts) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
