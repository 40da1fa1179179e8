use crate::config::OutputFormat;
use crate::model::CandidateRecord;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const CSV_HEADER: &str =
    "line,address,packetLoss,latencyMs,speedMbps,bandwidthMb,sourceLink,observedAt,rank";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Unchanged,
}

/// Renders `records` exactly in the given order.
pub fn render_records(records: &[CandidateRecord], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Plain => Ok(records
            .iter()
            .map(|record| format!("{}\n", record.address))
            .collect()),
        OutputFormat::Csv => Ok(render_csv(records)),
        OutputFormat::Json => {
            let mut json = serde_json::to_string_pretty(records)?;
            json.push('\n');
            Ok(json)
        }
    }
}

/// Writes `content` to `path` through a temp file in the same directory, so
/// readers only ever see the previous or the complete new file.
pub fn write_atomic(path: &Path, content: &str) -> Result<WriteStatus> {
    if let Ok(existing) = std::fs::read(path)
        && digest(&existing) == digest(content.as_bytes())
    {
        return Ok(WriteStatus::Unchanged);
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create output directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace output file {}", path.display()))?;

    Ok(WriteStatus::Written)
}

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn render_csv(records: &[CandidateRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for record in records {
        let fields = [
            record.line.clone().unwrap_or_default(),
            record.address.clone(),
            record.packet_loss.to_string(),
            record.latency_ms.to_string(),
            record.speed_mbps.to_string(),
            record.bandwidth_mb.to_string(),
            record.source_link.clone().unwrap_or_default(),
            record.observed_at.clone().unwrap_or_default(),
            record.rank.to_string(),
        ];
        let row = fields
            .iter()
            .map(|field| csv_escape(field))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&row);
        out.push('\n');
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
