use crate::config::{TableConfig, parse_selector};
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::debug;

static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("table selector must parse"));
static ROW: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("row selector must parse"));
static CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("cell selector must parse"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector must parse"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(|cell| cell.text.as_str())
    }

    pub fn link(&self, index: usize) -> Option<&str> {
        self.cells.get(index).and_then(|cell| cell.link.as_deref())
    }
}

/// A located data table: the first all-`th` row as header, then the data rows
/// in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Option<Row>,
    pub rows: Vec<Row>,
}

/// Finds the data table in `document` using the configured selector, falling
/// back to the first table that carries data rows when allowed.
///
/// Returns `Ok(None)` when no table qualifies.
pub fn locate_table(document: &str, config: &TableConfig) -> Result<Option<Table>> {
    let selector = parse_selector(&config.selector)?;
    let parsed = Html::parse_document(document);

    if let Some(table) = parsed.select(&selector).next() {
        debug!(selector = %config.selector, "table matched configured selector");
        return Ok(Some(read_table(table)));
    }

    if !config.fallback_first_table {
        return Ok(None);
    }

    let fallback = parsed
        .select(&TABLE)
        .map(read_table)
        .find(|table| !table.rows.is_empty());
    if fallback.is_some() {
        debug!(selector = %config.selector, "using first populated table as fallback");
    }
    Ok(fallback)
}

fn read_table(table: ElementRef<'_>) -> Table {
    let mut out = Table::default();

    for tr in table.select(&ROW) {
        if !belongs_to(tr, table) {
            continue;
        }

        let mut has_data_cell = false;
        let cells: Vec<Cell> = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| CELL.matches(el))
            .map(|el| {
                has_data_cell |= el.value().name() == "td";
                read_cell(el)
            })
            .collect();

        if cells.is_empty() {
            continue;
        }
        let row = Row { cells };
        if has_data_cell {
            out.rows.push(row);
        } else if out.header.is_none() {
            out.header = Some(row);
        }
    }

    out
}

/// Rows of nested tables belong to the nested table, not to `table`.
fn belongs_to(tr: ElementRef<'_>, table: ElementRef<'_>) -> bool {
    tr.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
        .is_some_and(|owner| owner.id() == table.id())
}

fn read_cell(cell: ElementRef<'_>) -> Cell {
    let text = cell
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let link = cell
        .select(&ANCHOR)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(ToString::to_string);

    Cell { text, link }
}
