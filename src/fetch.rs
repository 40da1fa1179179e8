use crate::config::{
    FetchConfig, FetchStrategy, LoadedTarget, MAX_TIMEOUT_SECS, ReadyCondition, RenderConfig,
    resolve_path,
};
use crate::render::{ChromiumRenderer, RenderSession, Renderer};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request returned non-success status {0}")]
    Status(u16),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("browser session failed: {0}")]
    Session(String),
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report which budget expired; callers overwrite this.
            FetchFailure::Timeout(Duration::ZERO)
        } else if err.is_connect() {
            FetchFailure::Connect(err.to_string())
        } else if err.is_builder() {
            FetchFailure::Request(err.to_string())
        } else {
            FetchFailure::Transport(err.to_string())
        }
    }
}

/// Outcome of one fetch attempt. Consumed once by the table locator.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub elapsed: Duration,
    pub outcome: Result<String, FetchFailure>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Single-attempt document retrieval. Retries, when wanted, wrap the whole
/// call.
#[derive(Clone)]
pub struct Fetcher {
    renderer: Arc<dyn Renderer>,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::with_renderer(Arc::new(ChromiumRenderer))
    }
}

impl Fetcher {
    pub fn with_renderer(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }

    pub fn fetch_target(&self, target: &LoadedTarget) -> FetchResult {
        let fetch = &target.config.fetch;
        let url = target.config.target.url.clone().unwrap_or_default();

        let result = match fetch.strategy {
            FetchStrategy::Static => self.fetch_static(&url, fetch),
            FetchStrategy::Rendered => self.fetch_rendered(&url, &fetch.render, fetch.timeout()),
            FetchStrategy::File => fetch_file(target),
            FetchStrategy::Inline => fetch_inline(target),
        };

        match &result.outcome {
            Ok(body) => info!(
                target_key = %target.config.target.key,
                url = %result.url,
                bytes = body.len(),
                elapsed_ms = result.elapsed.as_millis() as u64,
                "fetched document"
            ),
            Err(err) => warn!(
                target_key = %target.config.target.key,
                url = %result.url,
                error = %err,
                "fetch failed"
            ),
        }

        result
    }

    pub fn fetch_static(&self, url: &str, fetch: &FetchConfig) -> FetchResult {
        let started = Instant::now();
        let timeout = fetch.timeout();
        let outcome = request_document(url, fetch).map_err(|err| match err {
            FetchFailure::Timeout(_) => FetchFailure::Timeout(timeout),
            other => other,
        });

        FetchResult {
            url: url.to_string(),
            elapsed: started.elapsed(),
            outcome,
        }
    }

    /// Renders `url` in a fresh browser session and captures the document
    /// once the page is ready.
    ///
    /// The whole attempt, from launch to capture, ends by `timeout`; waiting
    /// for readiness is further capped by the configured ready timeout.
    /// Closing the session afterwards gets [`TEARDOWN_GRACE`] on top.
    pub fn fetch_rendered(
        &self,
        url: &str,
        render: &RenderConfig,
        timeout: Duration,
    ) -> FetchResult {
        let started = Instant::now();
        let outcome = self.render_document(url, render, timeout, started);

        FetchResult {
            url: url.to_string(),
            elapsed: started.elapsed(),
            outcome,
        }
    }

    fn render_document(
        &self,
        url: &str,
        render: &RenderConfig,
        timeout: Duration,
        started: Instant,
    ) -> Result<String, FetchFailure> {
        let budget = timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS));
        let deadline = started + budget;
        let ready_budget = render.ready_timeout().min(budget);
        let ready_deadline = started + ready_budget;

        let session = self
            .renderer
            .open(render, deadline)
            .map_err(|err| expired(err, budget))?;
        let mut session = SessionGuard::new(session);
        within(deadline, budget)?;

        session
            .inner()
            .navigate(url, deadline)
            .map_err(|err| expired(err, budget))?;
        within(deadline, budget)?;

        if render.ready == ReadyCondition::RowPresent {
            wait_until_ready(session.inner(), render, ready_deadline, ready_budget)?;
        }

        let settle = render.settle_delay();
        if !settle.is_zero() {
            let left = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(settle.min(left));
        }

        let html = session
            .inner()
            .content(deadline)
            .map_err(|err| expired(err, budget))?;
        within(deadline, budget)?;

        if let Err(err) = session.close() {
            warn!(url, error = %err, "browser session did not close cleanly");
        }
        Ok(html)
    }
}

/// Time allowed for shutting the browser down after an attempt has ended,
/// whether it succeeded or not.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

fn request_document(url: &str, fetch: &FetchConfig) -> Result<String, FetchFailure> {
    let mut headers = HeaderMap::new();
    for (k, v) in &fetch.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|err| FetchFailure::Request(format!("invalid header name {k}: {err}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|err| FetchFailure::Request(format!("invalid header value for {k}: {err}")))?;
        headers.insert(name, value);
    }
    if let Some(user_agent) = &fetch.user_agent {
        let value = HeaderValue::from_str(user_agent)
            .map_err(|err| FetchFailure::Request(format!("invalid user agent: {err}")))?;
        headers.insert(USER_AGENT, value);
    }

    let client = Client::builder()
        .timeout(fetch.timeout())
        .default_headers(headers)
        .build()?;

    let resp = client.get(url).send()?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchFailure::Status(status.as_u16()));
    }

    Ok(resp.text()?)
}

/// Replaces the placeholder duration of a session timeout with `budget`.
fn expired(err: FetchFailure, budget: Duration) -> FetchFailure {
    match err {
        FetchFailure::Timeout(_) => FetchFailure::Timeout(budget),
        other => other,
    }
}

fn within(deadline: Instant, budget: Duration) -> Result<(), FetchFailure> {
    if Instant::now() >= deadline {
        return Err(FetchFailure::Timeout(budget));
    }
    Ok(())
}

/// Polls until the page is ready or `deadline` passes. A ready page observed
/// only after the deadline still counts as a timeout.
fn wait_until_ready(
    session: &mut dyn RenderSession,
    render: &RenderConfig,
    deadline: Instant,
    budget: Duration,
) -> Result<(), FetchFailure> {
    let poll_interval = render.poll_interval();
    loop {
        let ready = page_ready(session, render, deadline).map_err(|err| expired(err, budget))?;

        let now = Instant::now();
        if now >= deadline {
            return Err(FetchFailure::Timeout(budget));
        }
        if ready {
            debug!(selector = %render.row_selector, "rendered table rows present");
            return Ok(());
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}

/// The loading indicator, when configured, must be gone, and at least one
/// row cell must hold real text rather than a placeholder.
fn page_ready(
    session: &mut dyn RenderSession,
    render: &RenderConfig,
    deadline: Instant,
) -> Result<bool, FetchFailure> {
    if let Some(loading) = &render.loading_selector
        && !session.visible_texts(loading, deadline)?.is_empty()
    {
        return Ok(false);
    }

    let texts = session.visible_texts(&render.row_selector, deadline)?;
    Ok(texts
        .iter()
        .any(|text| is_row_text(text, &render.placeholder_text)))
}

fn is_row_text(text: &str, placeholders: &[String]) -> bool {
    let text = text.trim();
    !text.is_empty()
        && !placeholders
            .iter()
            .any(|placeholder| placeholder.trim().eq_ignore_ascii_case(text))
}

/// Closes the wrapped session when dropped unless it was closed explicitly.
struct SessionGuard {
    session: Box<dyn RenderSession>,
    closed: bool,
}

impl SessionGuard {
    fn new(session: Box<dyn RenderSession>) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    fn inner(&mut self) -> &mut dyn RenderSession {
        self.session.as_mut()
    }

    fn close(&mut self) -> Result<(), FetchFailure> {
        self.closed = true;
        self.session
            .close(Instant::now() + TEARDOWN_GRACE)
            .map_err(|err| expired(err, TEARDOWN_GRACE))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close browser session");
        }
    }
}

fn fetch_file(target: &LoadedTarget) -> FetchResult {
    let started = Instant::now();
    let outcome = match target.config.fetch.file_path.as_ref() {
        None => Err(FetchFailure::Request(
            "fetch.file_path missing for file strategy".to_string(),
        )),
        Some(file_path) => resolve_path(&target.path, file_path)
            .map_err(|err| FetchFailure::Request(err.to_string()))
            .and_then(|resolved| {
                std::fs::read(&resolved)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(|err| FetchFailure::Read {
                        path: resolved.display().to_string(),
                        reason: err.to_string(),
                    })
            }),
    };

    // A configured target url stands in as the document's origin.
    let url = target.config.target.url.clone().unwrap_or_else(|| {
        target
            .config
            .fetch
            .file_path
            .as_ref()
            .and_then(|p| resolve_path(&target.path, p).ok())
            .map(|p| format!("file://{}", p.display()))
            .unwrap_or_default()
    });

    FetchResult {
        url,
        elapsed: started.elapsed(),
        outcome,
    }
}

fn fetch_inline(target: &LoadedTarget) -> FetchResult {
    let outcome = target.config.fetch.inline_data.clone().ok_or_else(|| {
        FetchFailure::Request("fetch.inline_data missing for inline strategy".to_string())
    });

    FetchResult {
        url: target
            .config
            .target
            .url
            .clone()
            .unwrap_or_else(|| format!("inline://{}", target.config.target.key)),
        elapsed: Duration::ZERO,
        outcome,
    }
}
