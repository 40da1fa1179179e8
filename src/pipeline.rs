use crate::config::{
    LoadedTarget, OutputFormat, TargetConfig, load_target_file, load_targets_from_dir,
};
use crate::extract::{choose_mapping, extract_rows};
use crate::fetch::{FetchFailure, FetchResult, Fetcher};
use crate::model::{CandidateRecord, Rejection, TargetCounts};
use crate::normalize::normalize_row;
use crate::rank::select_top;
use crate::sink::{WriteStatus, render_records, write_atomic};
use crate::table::locate_table;
use anyhow::{Context, Result, bail};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_dir: PathBuf,
    pub out_dir: PathBuf,
    pub target: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub config_dir: Option<PathBuf>,
    pub target_file: Option<PathBuf>,
}

/// Reasons a target produced no data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchFailure),
    #[error("no matching table found in document")]
    TableNotFound,
    #[error("no row matches any known column layout ({rows} data rows)")]
    SchemaMismatch { rows: usize },
    #[error("failed to write output: {0}")]
    Output(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// At least one record was selected.
    Selected,
    /// The table was read but no usable record survived.
    Empty,
    Failed(TargetFailure),
}

#[derive(Debug, Clone)]
pub struct OutputReport {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub status: WriteStatus,
}

#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target_key: String,
    pub url: String,
    pub outcome: TargetOutcome,
    pub schema: Option<String>,
    pub counts: TargetCounts,
    pub records: Vec<CandidateRecord>,
    pub rejections: Vec<Rejection>,
    pub outputs: Vec<OutputReport>,
}

impl TargetReport {
    fn new(target_key: &str, url: &str) -> Self {
        Self {
            target_key: target_key.to_string(),
            url: url.to_string(),
            outcome: TargetOutcome::Empty,
            schema: None,
            counts: TargetCounts::default(),
            records: Vec::new(),
            rejections: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn failed(mut self, failure: TargetFailure) -> Self {
        self.outcome = TargetOutcome::Failed(failure);
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Failed(_))
    }
}

pub fn run_targets(options: &RunOptions, fetcher: &Fetcher) -> Result<Vec<TargetReport>> {
    let mut targets = load_targets_from_dir(&options.config_dir)?;
    if let Some(filter) = &options.target {
        targets.retain(|t| t.config.target.key == *filter);
    }
    targets.retain(|t| {
        if !t.config.target.enabled {
            info!(target_key = %t.config.target.key, "target disabled; skipping");
        }
        t.config.target.enabled
    });
    if targets.is_empty() {
        bail!("no matching target configurations found");
    }

    Ok(run_loaded_targets(
        &targets,
        fetcher,
        &options.out_dir,
        options.dry_run,
    ))
}

/// Fetches every target concurrently, then runs the remaining stages for each
/// one in turn. A failing target never stops the others.
pub fn run_loaded_targets(
    targets: &[LoadedTarget],
    fetcher: &Fetcher,
    out_dir: &Path,
    dry_run: bool,
) -> Vec<TargetReport> {
    let fetched = fetch_all(targets, fetcher);
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    let mut reports = Vec::new();
    for (target, fetched) in targets.iter().zip(fetched) {
        let mut report = process_document(&target.config, fetched);

        if report.outcome == TargetOutcome::Selected {
            if dry_run {
                info!(target_key = %report.target_key, "dry run enabled; outputs not written");
            } else if let Err(err) =
                write_outputs(&target.config, out_dir, &timestamp, &mut report)
            {
                let message = format!("{err:#}");
                warn!(target_key = %report.target_key, error = %message, "output failed");
                report.outcome = TargetOutcome::Failed(TargetFailure::Output(message));
            }
        }

        reports.push(report);
    }

    reports
}

fn fetch_all(targets: &[LoadedTarget], fetcher: &Fetcher) -> Vec<FetchResult> {
    std::thread::scope(|scope| {
        let handles = targets
            .iter()
            .map(|target| scope.spawn(move || fetch_with_retries(fetcher, target)))
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .zip(targets)
            .map(|(handle, target)| {
                handle.join().unwrap_or_else(|_| FetchResult {
                    url: target.config.target.url.clone().unwrap_or_default(),
                    elapsed: Duration::ZERO,
                    outcome: Err(FetchFailure::Transport("fetch worker panicked".to_string())),
                })
            })
            .collect()
    })
}

/// Repeats whole fetch attempts; each attempt is bounded by its own timeout.
pub fn fetch_with_retries(fetcher: &Fetcher, target: &LoadedTarget) -> FetchResult {
    let attempts = target.config.fetch.retry_attempts.max(1);
    let backoff = Duration::from_millis(target.config.fetch.retry_backoff_ms);

    let mut attempt = 1;
    loop {
        let result = fetcher.fetch_target(target);
        if result.is_success() || attempt == attempts {
            return result;
        }
        warn!(
            target_key = %target.config.target.key,
            attempt,
            "fetch attempt failed; retrying"
        );
        attempt += 1;
        std::thread::sleep(backoff);
    }
}

/// Runs locate, extract, normalize and select over one fetched document.
pub fn process_document(config: &TargetConfig, fetched: FetchResult) -> TargetReport {
    let key = config.target.key.as_str();
    let mut report = TargetReport::new(key, &fetched.url);

    let document = match fetched.outcome {
        Ok(document) => document,
        Err(failure) => return report.failed(failure.into()),
    };

    let table = match locate_table(&document, &config.table) {
        Ok(Some(table)) => table,
        Ok(None) => {
            warn!(target_key = %key, selector = %config.table.selector, "no matching table");
            return report.failed(TargetFailure::TableNotFound);
        }
        Err(err) => {
            warn!(target_key = %key, error = %err, "table lookup failed");
            return report.failed(TargetFailure::TableNotFound);
        }
    };

    if table.rows.is_empty() {
        info!(target_key = %key, "table has no data rows");
        return report;
    }

    let Some(mapping) = choose_mapping(&table, &config.schema, config.table.max_rows) else {
        let rows = table.rows.len();
        warn!(target_key = %key, rows, "no column mapping fits the table");
        return report.failed(TargetFailure::SchemaMismatch { rows });
    };

    let extraction = extract_rows(&table, mapping, config.table.max_rows);
    report.schema = Some(extraction.schema.clone());
    report.counts.rows_seen = extraction.rows_seen;
    report.counts.rows_skipped = extraction.skipped;

    let base_url = Url::parse(&report.url).ok();
    let mut accepted = Vec::new();
    for raw in &extraction.rows {
        match normalize_row(raw, base_url.as_ref()) {
            Ok(record) => accepted.push(record),
            Err(rejection) => {
                debug!(
                    target_key = %key,
                    position = rejection.position,
                    value = %rejection.value,
                    reason = %rejection.reason,
                    "row rejected"
                );
                report.rejections.push(rejection);
            }
        }
    }
    report.counts.accepted = accepted.len();
    report.counts.rejected = report.rejections.len();

    let selection = select_top(accepted, &config.select);
    report.counts.duplicates_dropped = selection.duplicates_dropped;
    report.counts.selected = selection.records.len();
    report.records = selection.records;
    if !report.records.is_empty() {
        report.outcome = TargetOutcome::Selected;
    }

    info!(
        target_key = %key,
        schema = %extraction.schema,
        seen = report.counts.rows_seen,
        skipped = report.counts.rows_skipped,
        accepted = report.counts.accepted,
        rejected = report.counts.rejected,
        selected = report.counts.selected,
        "records selected"
    );

    report
}

fn write_outputs(
    config: &TargetConfig,
    out_dir: &Path,
    timestamp: &str,
    report: &mut TargetReport,
) -> Result<()> {
    let mut rendered = Vec::new();
    for output in &config.output {
        let path = output_path(config, out_dir, &output.path, timestamp);
        let content = render_records(&report.records, output.format)
            .with_context(|| format!("failed to render {}", path.display()))?;
        rendered.push((path, output.format, content));
    }

    for (path, format, content) in rendered {
        let status = write_atomic(&path, &content)?;
        info!(
            target_key = %report.target_key,
            file = %path.display(),
            records = report.records.len(),
            unchanged = status == WriteStatus::Unchanged,
            "output written"
        );
        report.outputs.push(OutputReport {
            path,
            format,
            status,
        });
    }

    Ok(())
}

fn output_path(config: &TargetConfig, out_dir: &Path, template: &str, timestamp: &str) -> PathBuf {
    let resolved = template
        .replace("{{key}}", &config.sanitized_key())
        .replace("{{timestamp}}", timestamp);
    let path = PathBuf::from(resolved);
    if path.is_absolute() {
        path
    } else {
        out_dir.join(path)
    }
}

pub fn validate_configs(options: &ValidateOptions) -> Result<Vec<String>> {
    let mut messages = Vec::new();

    if let Some(file) = &options.target_file {
        let target = load_target_file(file)?;
        messages.push(format!(
            "OK: {} ({})",
            target.config.target.key,
            file.display()
        ));
        return Ok(messages);
    }

    if let Some(dir) = &options.config_dir {
        let targets = load_targets_from_dir(dir)
            .with_context(|| format!("failed to load targets from {}", dir.display()))?;
        for target in targets {
            messages.push(format!(
                "OK: {} ({})",
                target.config.target.key,
                target.path.display()
            ));
        }
        return Ok(messages);
    }

    bail!("either --config-dir or --target-file must be provided");
}

/// One line per target for the end-of-run summary.
pub fn summary_line(report: &TargetReport) -> String {
    let status = match &report.outcome {
        TargetOutcome::Selected => "ok".to_string(),
        TargetOutcome::Empty => "empty".to_string(),
        TargetOutcome::Failed(failure) => format!("failed: {failure}"),
    };
    let c = &report.counts;
    format!(
        "{}: {status} | seen {} skipped {} accepted {} rejected {} duplicates {} selected {}",
        report.target_key,
        c.rows_seen,
        c.rows_skipped,
        c.accepted,
        c.rejected,
        c.duplicates_dropped,
        c.selected
    )
}

/// Exit contract of a run: at least one target selected records (and, unless
/// this was a dry run, wrote them, since a failed write marks the target
/// failed). With `strict`, every target must have selected records.
pub fn run_succeeded(reports: &[TargetReport], strict: bool) -> bool {
    let produced = reports
        .iter()
        .any(|r| r.outcome == TargetOutcome::Selected && !r.records.is_empty());
    let complete = reports.iter().all(|r| r.outcome == TargetOutcome::Selected);
    produced && (complete || !strict)
}
