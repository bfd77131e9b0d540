use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use tracing::info;

use rapporti_etl::logging::{init_logging, LogConfig};
use rapporti_etl::{
    error_count_by_code, error_details, fiscal_period, open_database, IngestConfig,
    LocalObjectStore, ObjectStore, StagingIngestionService,
};

fn main() -> Result<()> {
    let log_config = LogConfig::from_env().context("Invalid logging configuration")?;
    init_logging(&log_config).context("Failed to initialize logging")?;

    let config = IngestConfig::from_env().context("Invalid ingestion configuration")?;
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("errors") if args.len() > 2 => run_errors(&config, &args[2]),
        Some(data_dir) if data_dir != "errors" => run_ingest(&config, data_dir, args.get(2)),
        _ => {
            eprintln!("Usage:");
            eprintln!("  rapporti-etl <data-dir> [fiscal-year]   ingest every recognised file");
            eprintln!("  rapporti-etl errors <submission-id>     print rejected lines");
            std::process::exit(2);
        }
    }
}

fn run_ingest(config: &IngestConfig, data_dir: &str, fiscal_year: Option<&String>) -> Result<()> {
    let store = LocalObjectStore::new(data_dir);
    if !Path::new(data_dir).is_dir() {
        anyhow::bail!("Data directory not found: {}", data_dir);
    }

    let fiscal_year = match fiscal_year {
        Some(year) => Some(year.parse::<i32>().context("Fiscal year must be a number")?),
        None => store
            .list_objects("")?
            .iter()
            .find_map(|o| fiscal_period(o.file_name())),
    };

    let conn = open_database(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    let service = StagingIngestionService::new(&conn, config.clone())?;
    let submission = service.create_submission(fiscal_year)?;
    info!(submission_id = %submission.id, data_dir, "Ingesting directory");

    match service.ingest_submission(&store, &submission.id, "") {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(failure) => {
            let partial = serde_json::json!({
                "submission_id": failure.submission_id,
                "status": "ERROR",
                "files": failure.completed,
                "error": failure.error.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&partial)?);
            Err(failure.into())
        }
    }
}

fn run_errors(config: &IngestConfig, submission_id: &str) -> Result<()> {
    let conn = open_database(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    let by_code: serde_json::Map<String, serde_json::Value> = error_count_by_code(&conn, submission_id)?
        .into_iter()
        .map(|(code, count)| (code.code().to_string(), count.into()))
        .collect();
    let details = error_details(&conn, submission_id, None)?;

    let output = serde_json::json!({
        "submission_id": submission_id,
        "by_code": by_code,
        "errors": details,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
