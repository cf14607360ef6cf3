//! Harvester CLI - harvests one JSON lines file and submits its documents.

use anyhow::{bail, Context, Result};
use clap::Parser;
use harvest_service::etl::{Etl, JsonLinesExtractor, JsonTransformer, SUBMITTING_LOADER};
use harvest_service::events::StartSubmission;
use harvest_service::logging::{init_logging, LogLevel};
use harvest_service::{HarvesterService, ServiceConfig};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "harvester", version, about = "Harvest a JSON lines file into a bulk index")]
struct Cli {
    /// JSON lines file, one record per line
    input: PathBuf,

    /// Record field holding the document id
    #[arg(long, default_value = "id")]
    id_field: String,

    /// ETL name used in logs and reports
    #[arg(long, default_value = "jsonl")]
    name: String,

    /// Loader to use: "submit" sends documents while harvesting, "cache"
    /// stages them and submits after the harvest
    #[arg(long, default_value = SUBMITTING_LOADER)]
    loader: String,

    /// Bulk endpoint, overrides HARVESTER_BULK_URL
    #[arg(long)]
    bulk_url: Option<String>,

    /// Harvest even if the file did not change
    #[arg(long)]
    force: bool,

    /// Submit cached documents even if the harvest failed
    #[arg(long)]
    submit_failed: bool,

    /// Print the harvest report as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Harvest failed");
            eprintln!("Error: {:#}", e);
            process::exit(2);
        }
    }
}

/// Runs one harvest. Returns whether it fully succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = ServiceConfig::load().context("Invalid configuration")?;
    if cli.verbose {
        config.log.level = LogLevel::Debug;
    }
    if let Some(url) = cli.bulk_url {
        config.submission.url = Some(url);
    }
    init_logging(&config.log)?;

    let service = HarvesterService::new(config)?;
    let loader = service.create_loader(&cli.loader).await?;
    let caching = cli.loader != SUBMITTING_LOADER;

    service
        .register_etl(Etl::new(
            cli.name,
            Box::new(JsonLinesExtractor::new(&cli.input)),
            Box::new(JsonTransformer::new(cli.id_field)),
            loader,
        ))
        .await?;

    if service.init().await? == 0 {
        bail!("Cannot read {}", cli.input.display());
    }

    let started = service.trigger_harvest(cli.force).await?;
    let outcome = started.completion.wait().await?;
    info!("{}", outcome.summary());

    let mut success = outcome.success;
    let submission = if caching && outcome.changed {
        let report = service
            .submit_cached(StartSubmission {
                can_submit_outdated_documents: false,
                can_submit_failed_documents: cli.submit_failed,
            })
            .await?;
        success &= report.failed.is_empty();
        Some(report)
    } else {
        None
    };

    if cli.json {
        let report = serde_json::json!({
            "harvest": outcome,
            "submission": submission,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", outcome.summary());
        for etl in &outcome.etls {
            if let Some(error) = &etl.error {
                println!("  {}: {}", etl.name, error);
            }
        }
        if let Some(report) = &submission {
            println!("{}", report.summary());
        }
    }

    Ok(success)
}
