// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! Runs an `smtp_intake` server from a TOML configuration file until interrupted.

#![warn(clippy::nursery, clippy::pedantic)]

use std::{
    error::Error,
    fs::OpenOptions,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::Parser;
use smtp_intake::{
    config::{load_config, validate_config, Config},
    error::ConfigError,
    persistence::backend,
    timeouts, Listener, PersistenceGateway, ServerContext, WorkerPool,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Arguments {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "smtp_intake.toml")]
    config: PathBuf,

    /// Listen on this address instead of the configured `listen_interface`.
    #[arg(long = "if", value_name = "ADDRESS")]
    listen_interface: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let arguments = Arguments::parse();

    let mut config = load_config(&arguments.config)?;
    if let Some(listen_interface) = arguments.listen_interface {
        config.server.listen_interface = listen_interface;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }
    config.verbose |= arguments.verbose;

    init_tracing(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %arguments.config.display(),
        "smtp_intake starting"
    );

    if !config.server.is_enabled {
        tracing::info!("Server is disabled in the configuration, exiting");
        return Ok(());
    }

    let backend = backend::by_name(&config.backend_name)?;
    let (gateway, queue) =
        PersistenceGateway::new(config.save_workers_size, timeouts::SAVE_ACKNOWLEDGEMENT);
    let _workers = WorkerPool::spawn(&queue, &backend, config.save_workers_size)?;

    tracing::info!(
        host_name = %config.server.host_name,
        max_clients = config.server.max_clients,
        max_size = config.server.max_size,
        timeout_secs = config.server.timeout,
        start_tls = config.server.start_tls_on,
        tls_always_on = config.server.tls_always_on,
        "Configuration loaded"
    );

    let context = Arc::new(ServerContext::from_config(config.server, gateway)?);
    let admission = context.admission().clone();
    let listener = Listener::bind(&context.config().listen_interface, admission.clone()).await?;

    tokio::select! {
        () = smtp_intake::serve(listener, Arc::clone(&context)) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted, no longer accepting connections");
            admission.close();
        }
    }

    tracing::info!(
        active_connections = admission.active(),
        "Shutdown complete"
    );
    Ok(())
}

/// Log to the configured file, or standard error.
///
/// `RUST_LOG` overrides the level chosen by `verbose`.
fn init_tracing(config: &Config) -> std::io::Result<()> {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("smtp_intake={level},smtp_intake_daemon={level}").into()
    });

    let file = config
        .server
        .log_file
        .as_deref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?;

    let (file_layer, stderr_layer) = match file {
        Some(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        None => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}
