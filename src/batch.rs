use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::config::FileIoSettings;
use crate::errors::{AppError, AppResult};
use crate::extract::extract_places;
use crate::geocode::GeocodeResolver;
use crate::model::{QueryRecord, QueryStatus};
use crate::navigator::Navigator;
use crate::postprocess::{Pipeline, ProcessedBatch};
use crate::storage;
use crate::telemetry::Telemetry;

/// What one `step` did to one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub keyword: Option<String>,
    pub status: QueryStatus,
    pub navigated: bool,
    pub geocode_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub no: usize,
    pub query: Option<String>,
    pub status: QueryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: QueryStatus,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub entries: Vec<ReportEntry>,
    pub counts: Vec<StatusCount>,
}

impl BatchReport {
    pub fn count(&self, status: QueryStatus) -> usize {
        self.counts
            .iter()
            .find(|c| c.status == status)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

/// Owns the batch and advances it one record at a time.
pub struct BatchDriver {
    records: Vec<QueryRecord>,
    progress: usize,
    navigator: Navigator,
    resolver: GeocodeResolver,
    fileio: FileIoSettings,
    autosave_path: Option<PathBuf>,
    telemetry: Telemetry,
}

impl BatchDriver {
    pub fn new(
        records: Vec<QueryRecord>,
        navigator: Navigator,
        resolver: GeocodeResolver,
        fileio: FileIoSettings,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            records,
            progress: 0,
            navigator,
            resolver,
            fileio,
            autosave_path: None,
            telemetry,
        }
    }

    /// Enables periodic snapshots to `path`. Ignored when the autosave
    /// interval is zero.
    pub fn with_autosave<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.autosave_path = Some(path.into());
        self
    }

    pub fn records(&self) -> &[QueryRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<QueryRecord> {
        self.records
    }

    pub fn progress(&self) -> usize {
        self.progress
    }

    pub fn is_done(&self) -> bool {
        self.progress >= self.records.len()
    }

    /// Advances the next record. `Ok(None)` means every record has been
    /// visited. Progress moves forward even when the step fails.
    pub async fn step(&mut self) -> AppResult<Option<StepReport>> {
        if self.is_done() {
            return Ok(None);
        }
        let index = self.progress;
        self.progress += 1;

        let report = self.advance(index).await?;
        if report.status.is_complete() {
            self.autosave_if_due();
        }
        Ok(Some(report))
    }

    /// Steps until the end. A failing step is logged and skipped.
    pub async fn run(&mut self) -> BatchReport {
        let pending = self
            .records
            .iter()
            .filter(|r| !matches!(r.status, QueryStatus::Complete | QueryStatus::Missing))
            .count();
        self.telemetry.info(
            "batch_started",
            json!({ "total": self.records.len(), "pending": pending }),
        );

        loop {
            match self.step().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => self.telemetry.error(
                    "step_failed",
                    json!({ "index": self.progress - 1, "error": err.to_string() }),
                ),
            }
        }

        let report = self.report();
        self.telemetry
            .info("batch_finished", json!({ "counts": report.counts }));
        self.telemetry.flush();
        report
    }

    async fn advance(&mut self, index: usize) -> AppResult<StepReport> {
        let record = &self.records[index];
        let keyword = record.keyword().map(str::to_string);
        let mut report = StepReport {
            index,
            keyword: keyword.clone(),
            status: record.status,
            navigated: false,
            geocode_failures: 0,
        };

        let Some(keyword) = keyword else {
            transition(&mut self.records[index], QueryStatus::Missing)?;
            self.telemetry
                .warn("keyword_missing", json!({ "index": index }));
            report.status = QueryStatus::Missing;
            return Ok(report);
        };

        match record.status {
            QueryStatus::Complete | QueryStatus::Missing => {
                self.telemetry.debug(
                    "record_skipped",
                    json!({ "index": index, "status": record.status }),
                );
                return Ok(report);
            }
            QueryStatus::CompleteWithMissingMunicipalities => {
                let places = record.places.clone();
                let resolution = self.resolver.resolve_unresolved(places).await;
                report.geocode_failures = resolution.failures;
                report.status = completion_status(resolution.failures);
                let record = &mut self.records[index];
                transition(record, report.status)?;
                record.result_count = resolution.places.len();
                record.places = resolution.places;
                return Ok(report);
            }
            _ => {}
        }

        let lang = record
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(self.navigator.settings().lang.as_str())
            .to_string();
        {
            let record = &mut self.records[index];
            record.language = Some(lang.clone());
            record.timestamp = Utc::now().timestamp();
        }

        report.navigated = true;
        let navigation = match self.navigator.fetch(&keyword, &lang).await {
            Ok(navigation) => navigation,
            Err(err) => {
                self.telemetry.error(
                    "query_errored",
                    json!({ "index": index, "keyword": keyword, "error": err.to_string() }),
                );
                transition(&mut self.records[index], QueryStatus::Errored)?;
                report.status = QueryStatus::Errored;
                return Ok(report);
            }
        };

        let places = extract_places(&navigation.html, &lang);
        let resolution = self.resolver.resolve_all(places).await;
        report.geocode_failures = resolution.failures;
        report.status = completion_status(resolution.failures);

        let record = &mut self.records[index];
        transition(record, report.status)?;
        record.result_count = resolution.places.len();
        record.places = resolution.places;
        self.telemetry.info(
            "query_completed",
            json!({
                "index": index,
                "keyword": keyword,
                "results": record.result_count,
                "status": report.status,
            }),
        );
        Ok(report)
    }

    fn autosave_if_due(&self) {
        let every = self.fileio.autosave_every;
        let Some(path) = self.autosave_path.as_deref() else {
            return;
        };
        if every == 0 || self.progress % every != 0 {
            return;
        }
        match storage::write_json(path, &self.records, self.fileio.output_indent) {
            Ok(()) => self.telemetry.debug(
                "autosaved",
                json!({ "path": path.display().to_string(), "progress": self.progress }),
            ),
            Err(err) => self.telemetry.error(
                "autosave_failed",
                json!({ "path": path.display().to_string(), "error": err.to_string() }),
            ),
        }
    }

    pub fn report(&self) -> BatchReport {
        let entries = self
            .records
            .iter()
            .enumerate()
            .map(|(i, record)| ReportEntry {
                no: i + 1,
                query: record.keyword.clone(),
                status: record.status,
            })
            .collect();
        let counts = QueryStatus::ALL
            .iter()
            .map(|status| StatusCount {
                status: *status,
                count: self.records.iter().filter(|r| r.status == *status).count(),
            })
            .collect();
        BatchReport { entries, counts }
    }

    pub fn export_raw<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        storage::write_json(path, &self.records, self.fileio.output_indent)
    }

    /// Runs the pipeline on a copy of the batch and writes the result.
    pub fn export_processed<P: AsRef<Path>>(
        &self,
        path: P,
        pipeline: &Pipeline,
    ) -> AppResult<ProcessedBatch> {
        let processed = pipeline.run(&self.records);
        storage::write_json(path, &processed, self.fileio.output_indent)?;
        Ok(processed)
    }

    /// Deletes the autosave file unless it should be kept.
    pub fn remove_autosave(&self) -> AppResult<bool> {
        if self.fileio.keep_autosave || self.fileio.autosave_every == 0 {
            return Ok(false);
        }
        match self.autosave_path.as_deref() {
            Some(path) => storage::remove_if_exists(path),
            None => Ok(false),
        }
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.navigator.close().await?;
        Ok(())
    }
}

fn completion_status(failures: usize) -> QueryStatus {
    if failures > 0 {
        QueryStatus::CompleteWithMissingMunicipalities
    } else {
        QueryStatus::Complete
    }
}

fn transition(record: &mut QueryRecord, next: QueryStatus) -> AppResult<()> {
    if !record.status.can_advance_to(next) {
        return Err(AppError::InvalidTransition {
            from: record.status.as_tag(),
            to: next.as_tag(),
        });
    }
    record.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn record(status: QueryStatus) -> QueryRecord {
        QueryRecord::generate("cafe", Some("Kota Bandung"), Map::new()).with_status(status)
    }

    #[test]
    fn transition_rejects_regressions() {
        let mut complete = record(QueryStatus::Complete);
        assert!(transition(&mut complete, QueryStatus::Errored).is_err());
        assert_eq!(complete.status, QueryStatus::Complete);

        let mut errored = record(QueryStatus::Errored);
        transition(&mut errored, QueryStatus::CompleteWithMissingMunicipalities).unwrap();
        transition(&mut errored, QueryStatus::Complete).unwrap();
        assert_eq!(errored.status, QueryStatus::Complete);
    }

    #[test]
    fn completion_depends_on_failures() {
        assert_eq!(completion_status(0), QueryStatus::Complete);
        assert_eq!(
            completion_status(2),
            QueryStatus::CompleteWithMissingMunicipalities
        );
    }
}
