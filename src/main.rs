//! `news_ingest` binary.
//!
//! ```sh
//! news_ingest --backend duckdb --days-back 3
//! ```

use chrono::Local;
use clap::Parser;
use news_ingest::cli::Cli;
use news_ingest::config::Config;
use news_ingest::pipeline;
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: could not read .env: {e}");
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    debug!(?args.backend, ?args.config, "Parsed CLI arguments");

    let config = match Config::load(&args, Local::now().date_naive()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    if args.show_config {
        println!("{config}");
        return Ok(());
    }

    info!(
        backend = %config.backend,
        window = %config.window,
        sources = config.sources.len(),
        "news_ingest starting up"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received; finishing in-flight work");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Could not listen for Ctrl-C"),
        }
    });

    let summary = pipeline::run(&config, cancel).await?;
    println!("{summary}");
    for batch in &summary.failed_batches {
        warn!(
            records = batch.records.len(),
            attempts = batch.attempts,
            first_id = batch.records.first().map(|a| a.id.as_str()).unwrap_or("-"),
            error = %batch.message,
            "Batch was not written"
        );
    }
    if let Some(path) = &summary.failed_batches_path {
        warn!(path = %path.display(), "Records of failed batches saved for replay");
    }
    Ok(())
}
