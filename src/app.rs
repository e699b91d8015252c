use std::sync::Arc;

use serde_json::{json, Value};

use crate::batch::{BatchDriver, BatchReport};
use crate::config::{autosave_path_for, validate_output_path, AppConfig};
use crate::errors::AppResult;
use crate::geocode::GeocodeResolver;
use crate::model::{generate_batch, QueryRecord};
use crate::navigator::Navigator;
use crate::postprocess::{flatten, Pipeline, ProcessedBatch};
use crate::session::BrowserSession;
use crate::storage;
use crate::telemetry::{JsonlSink, Telemetry};
use crate::webdriver::WebDriverSession;

/// Where a run writes its results.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Postprocessed export. The autosave file sits next to it.
    pub output: String,
    pub raw_output: Option<String>,
    pub report_output: Option<String>,
    pub csv_output: Option<String>,
}

impl RunOptions {
    /// Validates the output path before any session is opened.
    pub fn new(output: &str, use_timestamp: bool) -> AppResult<Self> {
        Ok(Self {
            output: validate_output_path(output, use_timestamp)?,
            ..Self::default()
        })
    }

    pub fn autosave_path(&self) -> String {
        autosave_path_for(&self.output)
    }
}

/// Telemetry that logs through `tracing` and, when configured, appends to
/// the JSON Lines event log.
pub fn telemetry_for(config: &AppConfig) -> AppResult<Telemetry> {
    let telemetry = Telemetry::tracing();
    match &config.fileio.event_log_path {
        Some(path) => Ok(telemetry.with_sink(Arc::new(JsonlSink::new(path)?))),
        None => Ok(telemetry),
    }
}

/// Builds a fresh batch and reports how many items had a usable location.
pub fn generate(term: &str, items: Vec<Value>, telemetry: &Telemetry) -> Vec<QueryRecord> {
    let records = generate_batch(term, items);
    let missing = records.iter().filter(|r| r.keyword().is_none()).count();
    telemetry.info(
        "batch_generated",
        json!({ "term": term, "usable": records.len() - missing, "missing": missing }),
    );
    records
}

/// Opens a WebDriver session and runs the whole batch through it. A session
/// that fails to start aborts before any query is attempted.
pub async fn run_batch(
    records: Vec<QueryRecord>,
    config: &AppConfig,
    options: &RunOptions,
    telemetry: Telemetry,
) -> AppResult<BatchReport> {
    let resolver = GeocodeResolver::new(&config.geocode, telemetry.clone())?;
    if records.is_empty() {
        telemetry.warn("no_queries", json!({}));
        return Ok(BatchReport {
            entries: Vec::new(),
            counts: Vec::new(),
        });
    }
    let session = WebDriverSession::start(&config.webclient).await?;
    telemetry.info(
        "session_started",
        json!({ "browser": config.webclient.browser, "show": config.webclient.show }),
    );
    run_with_session(Box::new(session), resolver, records, config, options, telemetry).await
}

pub async fn run_with_session(
    session: Box<dyn BrowserSession>,
    resolver: GeocodeResolver,
    records: Vec<QueryRecord>,
    config: &AppConfig,
    options: &RunOptions,
    telemetry: Telemetry,
) -> AppResult<BatchReport> {
    let navigator = Navigator::new(session, config.query.clone(), telemetry.clone());
    let mut driver = BatchDriver::new(
        records,
        navigator,
        resolver,
        config.fileio.clone(),
        telemetry.clone(),
    )
    .with_autosave(options.autosave_path());

    let report = driver.run().await;
    if let Err(err) = driver.close().await {
        telemetry.warn("session_close_failed", json!({ "error": err.to_string() }));
    }

    if export_all(&driver, config, options, &report, &telemetry) {
        match driver.remove_autosave() {
            Ok(true) => telemetry.debug(
                "autosave_removed",
                json!({ "path": options.autosave_path() }),
            ),
            Ok(false) => {}
            Err(err) => telemetry.warn(
                "autosave_remove_failed",
                json!({ "error": err.to_string() }),
            ),
        }
    }
    telemetry.flush();
    Ok(report)
}

// Export failures are logged; the autosave stays in place when any fail.
fn export_all(
    driver: &BatchDriver,
    config: &AppConfig,
    options: &RunOptions,
    report: &BatchReport,
    telemetry: &Telemetry,
) -> bool {
    let mut ok = true;
    let mut record = |kind: &str, path: &str, result: AppResult<()>| match result {
        Ok(()) => telemetry.info("exported", json!({ "kind": kind, "path": path })),
        Err(err) => {
            ok = false;
            telemetry.error(
                "export_failed",
                json!({ "kind": kind, "path": path, "error": err.to_string() }),
            );
        }
    };

    if let Some(path) = &options.raw_output {
        record("raw", path, driver.export_raw(path));
    }

    let pipeline = Pipeline::new(config.postproc.clone(), telemetry.clone());
    let processed = driver.export_processed(&options.output, &pipeline);
    let rows = match &processed {
        Ok(ProcessedBatch::Flat(rows)) => rows.clone(),
        Ok(ProcessedBatch::Nested(records)) => flatten(records),
        Err(_) => Vec::new(),
    };
    record("processed", &options.output, processed.map(|_| ()));

    if let Some(path) = &options.csv_output {
        record("csv", path, storage::write_csv(path, &rows));
    }
    if let Some(path) = &options.report_output {
        record(
            "report",
            path,
            storage::write_json(path, report, config.fileio.output_indent),
        );
    }
    ok
}
