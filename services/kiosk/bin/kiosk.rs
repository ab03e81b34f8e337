//! Main Entrypoint for the Kiosk Console
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment, with command-line overrides.
//! 2. Initializing logging.
//! 3. Starting the transport, the event feed and the runtime.
//! 4. Reading commands from stdin and printing view changes.
//! 5. Shutting everything down on `/quit`, end of input or `Ctrl+C`.

use anyhow::Context;
use clap::Parser;
use kiosk_client::{
    config::Config,
    console::{self, HELP, Input},
    runtime::{Kiosk, UserCommand},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kiosk")]
#[command(about = "Console front end for the voice assistant kiosk", long_about = None)]
struct Cli {
    /// Realtime WebSocket endpoint (overrides KIOSK_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,
    /// Session API base URL (overrides KIOSK_HTTP_BASE)
    #[arg(long)]
    http_base: Option<String>,
    /// Task API base URL (overrides KIOSK_TASK_BASE)
    #[arg(long)]
    task_base: Option<String>,
    /// Session shown until the server announces its own (overrides KIOSK_DEFAULT_SESSION)
    #[arg(long)]
    session: Option<String>,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the kiosk.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(ws_url) = cli.ws_url {
        config.ws_url = ws_url;
    }
    if let Some(http_base) = cli.http_base {
        config.http_base = http_base.trim_end_matches('/').to_string();
    }
    if let Some(task_base) = cli.task_base {
        config.task_base = task_base.trim_end_matches('/').to_string();
    }
    if let Some(session) = cli.session {
        config.default_session = session;
    }
    config.validate().context("Invalid command-line override")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(
        ws_url = %config.ws_url,
        http_base = %config.http_base,
        task_base = %config.task_base,
        "Configuration loaded. Starting kiosk..."
    );

    // --- 3. Start the Kiosk ---
    let token = CancellationToken::new();
    let kiosk = Kiosk::launch(config, token.clone());
    let commands = kiosk.commands.clone();
    let mut view = kiosk.view.clone();
    println!("{HELP}");

    // --- 4. Console Loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = view.borrow_and_update().clone();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = view.borrow_and_update().clone();
                print_lines(console::changes(&shown, &next));
                shown = next;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("End of input");
                    break;
                };
                match console::parse(&line) {
                    None => {}
                    Some(Input::Command(command)) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Some(Input::Sessions) => {
                        if commands.send(UserCommand::RefreshSessions).await.is_err() {
                            break;
                        }
                        print_lines(console::session_list(&shown));
                    }
                    Some(Input::Tasks) => print_lines(console::task_list(&shown)),
                    Some(Input::Help) => println!("{HELP}"),
                    Some(Input::Quit) => break,
                    Some(Input::Invalid(reason)) => println!("? {reason}"),
                }
            }
        }
    }

    // --- 5. Shutdown ---
    kiosk.shutdown().await;
    info!("Kiosk has shut down.");
    Ok(())
}
