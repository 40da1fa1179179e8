use crate::config::SelectConfig;
use crate::model::CandidateRecord;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub records: Vec<CandidateRecord>,
    pub duplicates_dropped: usize,
}

/// Orders `records` by descending speed and keeps the top `top_n`.
///
/// Unknown speeds sort after every known speed. Equal keys keep their input
/// order. With `group_by_line` each distinct line is ranked and capped on its
/// own, groups following the order in which their line first appeared.
/// `rank` is reassigned over the final sequence.
pub fn select_top(records: Vec<CandidateRecord>, options: &SelectConfig) -> Selection {
    let mut selection = Selection::default();

    if options.group_by_line {
        for group in group_by_line(records) {
            let (mut picked, dropped) = select_scope(group, options.top_n, options.dedup);
            selection.records.append(&mut picked);
            selection.duplicates_dropped += dropped;
        }
    } else {
        let (picked, dropped) = select_scope(records, options.top_n, options.dedup);
        selection.records = picked;
        selection.duplicates_dropped = dropped;
    }

    for (index, record) in selection.records.iter_mut().enumerate() {
        record.rank = index + 1;
    }
    selection
}

fn select_scope(
    mut records: Vec<CandidateRecord>,
    top_n: usize,
    dedup: bool,
) -> (Vec<CandidateRecord>, usize) {
    // Vec::sort_by is stable.
    records.sort_by(|a, b| a.speed_mbps.cmp_desc(b.speed_mbps));

    let mut dropped = 0;
    if dedup {
        let mut seen = HashSet::new();
        records.retain(|record| {
            let first = seen.insert(record.address.clone());
            if !first {
                dropped += 1;
            }
            first
        });
    }

    records.truncate(top_n);
    (records, dropped)
}

fn group_by_line(records: Vec<CandidateRecord>) -> Vec<Vec<CandidateRecord>> {
    let mut groups: Vec<(Option<String>, Vec<CandidateRecord>)> = Vec::new();
    for record in records {
        match groups.iter_mut().find(|(line, _)| *line == record.line) {
            Some((_, members)) => members.push(record),
            None => groups.push((record.line.clone(), vec![record])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}
