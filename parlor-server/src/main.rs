//! Parlor server -- a multi-user chat room over line-oriented TCP.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:2022
//! cargo run --bin parlor-server
//!
//! # Operators, a MOTD, and a transcript
//! cargo run --bin parlor-server -- --admin ops.keys --motd motd.txt --chat-log chat.log
//!
//! # Or via environment variables
//! PARLOR_ADDR=127.0.0.1:2222 PARLOR_LOG=debug cargo run --bin parlor-server
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parlor::auth::Auth;
use parlor::builtin::default_commands;
use parlor::host::Host;
use parlor::room::Room;
use parlor::theme::Theme;
use parlor_server::config::{CliArgs, ServerConfig};
use parlor_server::keys::{LoadError, load_keys, load_motd};
use parlor_server::tcp;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    let auth = match build_auth(&config) {
        Ok(auth) => Arc::new(auth),
        Err(e) => {
            tracing::error!(error = %e, "failed to load credentials");
            std::process::exit(1);
        }
    };

    let room = Arc::new(Room::new(
        config.room_config(),
        default_commands(Arc::clone(&auth)),
    ));
    if let Some(path) = &config.motd_file {
        match load_motd(path) {
            Ok(motd) => room.set_motd(motd),
            Err(e) => {
                tracing::error!(error = %e, "failed to load MOTD");
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = &config.chat_log {
        match open_chat_log(path) {
            Ok(file) => room.history().set_output(Some(Box::new(file))),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open chat log");
                std::process::exit(1);
            }
        }
    }

    let theme = Theme::named(&config.theme).unwrap_or_else(|| {
        tracing::warn!(theme = %config.theme, "unknown theme, using default");
        Theme::default()
    });
    let host = Arc::new(
        Host::new(Arc::clone(&room), Arc::clone(&auth))
            .with_delivery(config.delivery())
            .with_theme(Some(theme)),
    );

    let consumer = Arc::clone(&room);
    let mut room_task = tokio::spawn(async move { consumer.serve().await });

    tracing::info!(addr = %config.bind_addr, "starting parlor server");
    let (bound_addr, accept_task) = match tcp::start_server(&config.bind_addr, host).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bound_addr, "server listening");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to wait for shutdown signal");
            }
            tracing::info!("shutting down");
        }
        result = &mut room_task => {
            if let Err(e) = result {
                tracing::error!(error = %e, "room task failed");
            }
        }
    }

    accept_task.abort();
    room.close();
    if tokio::time::timeout(Duration::from_secs(5), room_task).await.is_err() {
        tracing::warn!("room did not stop in time");
    }
}

/// Installs the tracing subscriber. With a log file, output goes through a
/// non-blocking appender whose guard must outlive the program.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((dir, file_name)) = file_path.and_then(|p| Some((p.parent()?, p.file_name()?))) else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn build_auth(config: &ServerConfig) -> Result<Auth, LoadError> {
    let mut auth = Auth::new();
    if let Some(passphrase) = &config.passphrase {
        auth = auth.with_passphrase(passphrase);
    }
    if let Some(path) = &config.whitelist_file {
        let keys = load_keys(path)?;
        tracing::info!(path = %path.display(), count = keys.len(), "loaded whitelist");
        for key in &keys {
            auth.whitelist(key, Duration::ZERO);
        }
    }
    if let Some(path) = &config.ops_file {
        let keys = load_keys(path)?;
        tracing::info!(path = %path.display(), count = keys.len(), "loaded operators");
        for key in &keys {
            auth.op(key, Duration::ZERO);
        }
    }
    Ok(auth)
}

fn open_chat_log(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}
