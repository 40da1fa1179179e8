use edgepick::config::SelectConfig;
use edgepick::model::{CandidateRecord, Metric};
use edgepick::rank::select_top;

fn record(address: &str, line: Option<&str>, speed: Option<f64>) -> CandidateRecord {
    CandidateRecord {
        line: line.map(ToString::to_string),
        address: address.to_string(),
        packet_loss: Metric::Unknown,
        latency_ms: Metric::Unknown,
        speed_mbps: speed.map_or(Metric::Unknown, Metric::known),
        bandwidth_mb: Metric::Unknown,
        source_link: None,
        observed_at: None,
        rank: 0,
    }
}

fn options(top_n: usize) -> SelectConfig {
    SelectConfig {
        top_n,
        ..SelectConfig::default()
    }
}

fn addresses(records: &[CandidateRecord]) -> Vec<&str> {
    records.iter().map(|r| r.address.as_str()).collect()
}

fn sample() -> Vec<CandidateRecord> {
    vec![
        record("1.0.0.1", Some("电信"), Some(3.0)),
        record("1.0.0.2", Some("联通"), None),
        record("1.0.0.3", Some("电信"), Some(9.5)),
        record("1.0.0.4", Some("移动"), Some(3.0)),
        record("1.0.0.5", Some("联通"), Some(0.0)),
        record("1.0.0.6", Some("移动"), None),
        record("1.0.0.7", Some("电信"), Some(7.25)),
    ]
}

#[test]
fn top_n_is_sorted_by_speed_with_unknown_last() {
    let selection = select_top(sample(), &options(7));

    assert_eq!(
        addresses(&selection.records),
        vec![
            "1.0.0.3", "1.0.0.7", "1.0.0.1", "1.0.0.4", "1.0.0.5", "1.0.0.2", "1.0.0.6"
        ]
    );
    let ranks: Vec<usize> = selection.records.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn measured_zero_ranks_ahead_of_unknown() {
    let records = vec![record("1.0.0.1", None, None), record("1.0.0.2", None, Some(0.0))];
    let selection = select_top(records, &options(2));
    assert_eq!(addresses(&selection.records), vec!["1.0.0.2", "1.0.0.1"]);
}

#[test]
fn selecting_from_more_records_returns_exactly_n() {
    let selection = select_top(sample(), &options(3));
    assert_eq!(selection.records.len(), 3);
    assert_eq!(
        addresses(&selection.records),
        vec!["1.0.0.3", "1.0.0.7", "1.0.0.1"]
    );
}

#[test]
fn selecting_from_fewer_records_never_pads() {
    let selection = select_top(sample(), &options(50));
    assert_eq!(selection.records.len(), 7);

    let selection = select_top(Vec::new(), &options(10));
    assert!(selection.records.is_empty());
}

#[test]
fn reselecting_a_selection_is_idempotent() {
    let first = select_top(sample(), &options(5));
    let second = select_top(first.records.clone(), &options(5));
    assert_eq!(first.records, second.records);
}

#[test]
fn truncation_happens_after_sorting() {
    // The fastest record is last in extraction order.
    let records = vec![
        record("1.0.0.1", None, Some(1.0)),
        record("1.0.0.2", None, Some(2.0)),
        record("1.0.0.3", None, Some(50.0)),
    ];
    let selection = select_top(records, &options(1));
    assert_eq!(addresses(&selection.records), vec!["1.0.0.3"]);
}

#[test]
fn known_then_unknown_speed_keeps_that_order() {
    let records = vec![record("1.0.0.1", None, Some(5.0)), record("1.0.0.2", None, None)];
    let selection = select_top(records, &options(2));
    assert_eq!(selection.records[0].speed_mbps, Metric::Known(5.0));
    assert_eq!(selection.records[1].speed_mbps, Metric::Unknown);
}

#[test]
fn grouping_ranks_each_line_independently() {
    let selection = select_top(
        sample(),
        &SelectConfig {
            top_n: 2,
            group_by_line: true,
            dedup: false,
        },
    );

    // Groups appear in order of first appearance: 电信, 联通, 移动.
    assert_eq!(
        addresses(&selection.records),
        vec!["1.0.0.3", "1.0.0.7", "1.0.0.5", "1.0.0.2", "1.0.0.4", "1.0.0.6"]
    );
    let ranks: Vec<usize> = selection.records.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn duplicates_are_kept_unless_dedup_is_enabled() {
    let records = vec![
        record("1.0.0.1", Some("电信"), Some(2.0)),
        record("1.0.0.1", Some("联通"), Some(8.0)),
        record("1.0.0.2", Some("移动"), Some(4.0)),
    ];

    let kept = select_top(records.clone(), &options(3));
    assert_eq!(kept.records.len(), 3);
    assert_eq!(kept.duplicates_dropped, 0);

    let deduped = select_top(
        records,
        &SelectConfig {
            top_n: 3,
            group_by_line: false,
            dedup: true,
        },
    );
    assert_eq!(addresses(&deduped.records), vec!["1.0.0.1", "1.0.0.2"]);
    // The faster occurrence wins because it comes first in sorted order.
    assert_eq!(deduped.records[0].line.as_deref(), Some("联通"));
    assert_eq!(deduped.duplicates_dropped, 1);
}

#[test]
fn dedup_runs_before_truncation() {
    let records = vec![
        record("1.0.0.1", None, Some(9.0)),
        record("1.0.0.1", None, Some(8.0)),
        record("1.0.0.2", None, Some(7.0)),
    ];
    let selection = select_top(
        records,
        &SelectConfig {
            top_n: 2,
            group_by_line: false,
            dedup: true,
        },
    );
    assert_eq!(addresses(&selection.records), vec!["1.0.0.1", "1.0.0.2"]);
}
