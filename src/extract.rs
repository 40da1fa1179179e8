use crate::config::ColumnMapping;
use crate::model::RawRow;
use crate::table::{Row, Table};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub schema: String,
    pub rows: Vec<RawRow>,
    /// Data rows consumed, bounded by `max_rows`.
    pub rows_seen: usize,
    /// Rows narrower than the mapping's required column count.
    pub skipped: usize,
}

/// Picks the first mapping, in declaration order, that fits at least one of
/// the first `max_rows` data rows and whose header hint (if any) agrees with
/// the table header.
pub fn choose_mapping<'a>(
    table: &Table,
    mappings: &'a [ColumnMapping],
    max_rows: usize,
) -> Option<&'a ColumnMapping> {
    mappings.iter().find(|mapping| {
        let required = mapping.required_columns();
        let fits_rows = table
            .rows
            .iter()
            .take(max_rows)
            .any(|row| row.len() >= required);
        fits_rows && header_agrees(table.header.as_ref(), mapping)
    })
}

fn header_agrees(header: Option<&Row>, mapping: &ColumnMapping) -> bool {
    let (Some(header), Some(hint)) = (header, mapping.header_hint.as_deref()) else {
        return true;
    };
    header
        .text(mapping.address)
        .is_some_and(|text| text.to_lowercase().contains(&hint.to_lowercase()))
}

/// Reads cell values by role from at most `max_rows` data rows.
pub fn extract_rows(table: &Table, mapping: &ColumnMapping, max_rows: usize) -> Extraction {
    let required = mapping.required_columns();
    let mut out = Extraction {
        schema: mapping.name.clone(),
        ..Extraction::default()
    };

    for (position, row) in table.rows.iter().take(max_rows).enumerate() {
        out.rows_seen += 1;
        if row.len() < required {
            debug!(
                position,
                columns = row.len(),
                required,
                schema = %mapping.name,
                "skipping short row"
            );
            out.skipped += 1;
            continue;
        }

        out.rows.push(RawRow {
            position,
            line: cell_text(row, mapping.line),
            address: row.text(mapping.address).unwrap_or_default().to_string(),
            packet_loss: cell_text(row, mapping.packet_loss),
            latency: cell_text(row, mapping.latency),
            speed: cell_text(row, mapping.speed),
            bandwidth: cell_text(row, mapping.bandwidth),
            link: mapping
                .link
                .and_then(|index| row.link(index))
                .map(ToString::to_string),
            observed_at: cell_text(row, mapping.observed_at),
        });
    }

    out
}

fn cell_text(row: &Row, index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| row.text(i))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}
