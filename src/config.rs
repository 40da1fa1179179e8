use anyhow::{Context, Result, anyhow, bail};
use scraper::Selector;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct LoadedTarget {
    pub path: PathBuf,
    pub config: TargetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub target: TargetMeta,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub schema: Vec<ColumnMapping>,
    #[serde(default)]
    pub select: SelectConfig,
    #[serde(default)]
    pub output: Vec<OutputConfig>,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.key.trim().is_empty() {
            bail!("target.key must not be empty");
        }
        if self.target.name.trim().is_empty() {
            bail!("target.name must not be empty");
        }

        match self.fetch.strategy {
            FetchStrategy::Static | FetchStrategy::Rendered => {
                let Some(url) = self.target.url.as_deref() else {
                    bail!("target.url is required for network fetch strategies");
                };
                url::Url::parse(url).with_context(|| format!("invalid target.url {url}"))?;
            }
            FetchStrategy::File => {
                if self.fetch.file_path.is_none() {
                    bail!("fetch.file_path is required for file strategy");
                }
            }
            FetchStrategy::Inline => {
                if self.fetch.inline_data.is_none() {
                    bail!("fetch.inline_data is required for inline strategy");
                }
            }
        }

        if !(1..=MAX_TIMEOUT_SECS).contains(&self.fetch.timeout_secs) {
            bail!("fetch.timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}");
        }
        if self.fetch.strategy == FetchStrategy::Rendered {
            let render = &self.fetch.render;
            if !(1..=MAX_TIMEOUT_SECS).contains(&render.ready_timeout_secs) {
                bail!("fetch.render.ready_timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}");
            }
            parse_selector(&render.row_selector).context("invalid fetch.render.row_selector")?;
            if let Some(loading) = &render.loading_selector {
                parse_selector(loading).context("invalid fetch.render.loading_selector")?;
            }
        }

        parse_selector(&self.table.selector).context("invalid table.selector")?;
        if self.table.max_rows == 0 {
            bail!("table.max_rows must be greater than zero");
        }

        if self.schema.is_empty() {
            bail!("at least one [[schema]] column mapping is required");
        }
        for mapping in &self.schema {
            mapping
                .validate()
                .with_context(|| format!("invalid schema mapping {}", mapping.name))?;
        }

        if self.select.top_n == 0 {
            bail!("select.top_n must be greater than zero");
        }

        for output in &self.output {
            if output.path.trim().is_empty() {
                bail!("output.path must not be empty");
            }
        }

        Ok(())
    }

    pub fn sanitized_key(&self) -> String {
        sanitize_for_path(&self.target.key)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetMeta {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    #[default]
    Static,
    Rendered,
    File,
    Inline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub strategy: FetchStrategy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u8,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub inline_data: Option<String>,
    #[serde(default)]
    pub render: RenderConfig,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.min(MAX_TIMEOUT_SECS))
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            strategy: FetchStrategy::Static,
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            user_agent: None,
            headers: BTreeMap::new(),
            file_path: None,
            inline_data: None,
            render: RenderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadyCondition {
    /// At least one element matches `row_selector`.
    #[default]
    RowPresent,
    /// Sleep for `settle_ms` (or the default settle delay when it is zero).
    SettleDelay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub ready: ReadyCondition,
    #[serde(default = "default_row_selector")]
    pub row_selector: String,
    /// Indicator shown while the table is loading; readiness waits until no
    /// element matching it is visible.
    #[serde(default)]
    pub loading_selector: Option<String>,
    /// Cell texts that mark a row as not yet filled in.
    #[serde(default = "default_placeholder_text")]
    pub placeholder_text: Vec<String>,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub settle_ms: u64,
    #[serde(default = "default_browser_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

impl RenderConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs.min(MAX_TIMEOUT_SECS))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn settle_delay(&self) -> Duration {
        match (self.ready, self.settle_ms) {
            (ReadyCondition::SettleDelay, 0) => Duration::from_millis(DEFAULT_SETTLE_MS),
            (_, ms) => Duration::from_millis(ms),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ready: ReadyCondition::RowPresent,
            row_selector: default_row_selector(),
            loading_selector: None,
            placeholder_text: default_placeholder_text(),
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: 0,
            args: default_browser_args(),
            executable: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_table_selector")]
    pub selector: String,
    #[serde(default = "default_true")]
    pub fallback_first_table: bool,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            selector: default_table_selector(),
            fallback_first_table: true,
            max_rows: default_max_rows(),
        }
    }
}

/// Binds semantic roles to 0-based column positions for one known layout of
/// the source table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ColumnMapping {
    pub name: String,
    pub address: usize,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub packet_loss: Option<usize>,
    #[serde(default)]
    pub latency: Option<usize>,
    #[serde(default)]
    pub speed: Option<usize>,
    #[serde(default)]
    pub bandwidth: Option<usize>,
    #[serde(default)]
    pub link: Option<usize>,
    #[serde(default)]
    pub observed_at: Option<usize>,
    #[serde(default)]
    pub header_hint: Option<String>,
    #[serde(default)]
    pub min_columns: Option<usize>,
}

impl ColumnMapping {
    fn bound_indices(&self) -> Vec<(&'static str, usize)> {
        [
            ("address", Some(self.address)),
            ("line", self.line),
            ("packet_loss", self.packet_loss),
            ("latency", self.latency),
            ("speed", self.speed),
            ("bandwidth", self.bandwidth),
            ("link", self.link),
            ("observed_at", self.observed_at),
        ]
        .into_iter()
        .filter_map(|(role, index)| index.map(|i| (role, i)))
        .collect()
    }

    /// Smallest row width this mapping can read from.
    pub fn required_columns(&self) -> usize {
        let widest = self
            .bound_indices()
            .into_iter()
            .map(|(_, index)| index + 1)
            .max()
            .unwrap_or(1);
        self.min_columns.map_or(widest, |min| min.max(widest))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("schema.name must not be empty");
        }

        let mut seen = BTreeSet::new();
        for (role, index) in self.bound_indices() {
            if !seen.insert(index) {
                bail!("column {index} is bound to more than one role (second: {role})");
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub group_by_line: bool,
    #[serde(default)]
    pub dedup: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            group_by_line: false,
            dedup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Plain,
    Csv,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub path: String,
    #[serde(default)]
    pub format: OutputFormat,
}

pub fn load_targets_from_dir(config_dir: &Path) -> Result<Vec<LoadedTarget>> {
    if !config_dir.exists() {
        bail!("config dir does not exist: {}", config_dir.display());
    }

    let mut loaded = Vec::new();
    for entry in WalkDir::new(config_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }

        loaded.push(load_target_file(path)?);
    }

    loaded.sort_by(|a, b| a.config.target.key.cmp(&b.config.target.key));
    Ok(loaded)
}

pub fn load_target_file(config_path: &Path) -> Result<LoadedTarget> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read target config: {}", config_path.display()))?;
    let config = parse_target_config(&text)
        .with_context(|| format!("invalid target config {}", config_path.display()))?;
    Ok(LoadedTarget {
        path: config_path.to_path_buf(),
        config,
    })
}

pub fn parse_target_config(text: &str) -> Result<TargetConfig> {
    let config: TargetConfig = toml::from_str(text).context("failed to parse toml")?;
    config.validate()?;
    Ok(config)
}

pub fn resolve_path(base_config_path: &Path, maybe_relative: &Path) -> Result<PathBuf> {
    if maybe_relative.is_absolute() {
        return Ok(maybe_relative.to_path_buf());
    }

    let parent = base_config_path.parent().ok_or_else(|| {
        anyhow!(
            "target config has no parent directory: {}",
            base_config_path.display()
        )
    })?;

    Ok(parent.join(maybe_relative))
}

pub fn sanitize_for_path(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

pub(crate) fn parse_selector(text: &str) -> Result<Selector> {
    Selector::parse(text).map_err(|err| anyhow!("invalid css selector {text}: {err:?}"))
}

/// Upper bound for any configured timeout, one hour.
pub const MAX_TIMEOUT_SECS: u64 = 3_600;

const DEFAULT_SETTLE_MS: u64 = 3_000;

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_retry_attempts() -> u8 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_row_selector() -> String {
    "table.table-striped tbody tr".to_string()
}

fn default_placeholder_text() -> Vec<String> {
    vec!["Loading...".to_string()]
}

fn default_ready_timeout_secs() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_browser_args() -> Vec<String> {
    vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
    ]
}

fn default_table_selector() -> String {
    "table.table-striped".to_string()
}

fn default_max_rows() -> usize {
    100
}

fn default_top_n() -> usize {
    10
}
