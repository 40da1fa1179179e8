use crate::model::{CandidateRecord, Metric, RawRow, RejectReason, Rejection};
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use url::Url;

static LEADING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?|\.\d+)").expect("leading number regex must be valid")
});

/// Validates the address and parses every metric of `raw`.
///
/// Only the address can reject a row; unreadable metrics become
/// [`Metric::Unknown`]. `rank` is left at zero for the selector to assign.
pub fn normalize_row(raw: &RawRow, base_url: Option<&Url>) -> Result<CandidateRecord, Rejection> {
    let address = normalize_address(&raw.address).ok_or_else(|| Rejection {
        position: raw.position,
        value: raw.address.clone(),
        reason: RejectReason::InvalidAddress,
    })?;

    Ok(CandidateRecord {
        line: raw.line.clone(),
        address,
        packet_loss: parse_percent(raw.packet_loss.as_deref()),
        latency_ms: parse_quantity(raw.latency.as_deref()),
        speed_mbps: parse_quantity(raw.speed.as_deref()),
        bandwidth_mb: parse_quantity(raw.bandwidth.as_deref()),
        source_link: raw
            .link
            .as_deref()
            .map(|href| absolutize_url(base_url, href)),
        observed_at: raw.observed_at.clone(),
        rank: 0,
    })
}

/// Strips an IPv6-style `[...]` wrapper and returns the literal if it parses
/// as an IPv4 or IPv6 address.
pub fn normalize_address(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let literal = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed)
        .trim();

    if literal.is_empty() {
        return None;
    }
    literal.parse::<IpAddr>().ok().map(|_| literal.to_string())
}

/// Leading number of a cell such as `"136.85ms"` or `"6.92 MB/s"`.
pub fn parse_quantity(value: Option<&str>) -> Metric {
    value
        .and_then(leading_number)
        .map_or(Metric::Unknown, Metric::known)
}

/// Percentage cell converted to a fraction; values above 100% are unknown.
pub fn parse_percent(value: Option<&str>) -> Metric {
    match value.and_then(leading_number) {
        Some(percent) if percent <= 100.0 => Metric::known(percent / 100.0),
        _ => Metric::Unknown,
    }
}

fn leading_number(text: &str) -> Option<f64> {
    let caps = LEADING_NUMBER.captures(text)?;
    caps.get(1)?.as_str().parse::<f64>().ok()
}

fn absolutize_url(base_url: Option<&Url>, value: &str) -> String {
    if Url::parse(value).is_ok() {
        return value.to_string();
    }

    base_url
        .and_then(|base| base.join(value).ok())
        .map(|joined| joined.to_string())
        .unwrap_or_else(|| value.to_string())
}
