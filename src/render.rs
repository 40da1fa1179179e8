//! Browser automation behind the `rendered` fetch strategy.
//!
//! A [`Renderer`] opens one exclusive [`RenderSession`] per fetch. The fetcher
//! owns the session for the duration of a single call and closes it on every
//! exit path. Every session operation receives the instant by which it must
//! have finished.

use crate::config::RenderConfig;
use crate::fetch::FetchFailure;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use futures::StreamExt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub trait RenderSession {
    fn navigate(&mut self, url: &str, deadline: Instant) -> Result<(), FetchFailure>;
    /// Trimmed text of every element matching `selector` that is currently
    /// laid out on the page. Hidden elements are left out.
    fn visible_texts(&mut self, selector: &str, deadline: Instant)
    -> Result<Vec<String>, FetchFailure>;
    fn content(&mut self, deadline: Instant) -> Result<String, FetchFailure>;
    fn close(&mut self, deadline: Instant) -> Result<(), FetchFailure>;
}

pub trait Renderer: Send + Sync {
    fn open(
        &self,
        config: &RenderConfig,
        deadline: Instant,
    ) -> Result<Box<dyn RenderSession>, FetchFailure>;
}

/// Headless Chromium driven over the DevTools protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromiumRenderer;

impl Renderer for ChromiumRenderer {
    fn open(
        &self,
        config: &RenderConfig,
        deadline: Instant,
    ) -> Result<Box<dyn RenderSession>, FetchFailure> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| FetchFailure::Session(format!("failed to start runtime: {err}")))?;

        let mut builder = BrowserConfig::builder().request_timeout(remaining(deadline)?);
        for arg in &config.args {
            builder = builder.arg(arg.as_str());
        }
        if let Some(executable) = &config.executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder.build().map_err(FetchFailure::Session)?;

        let (browser, mut handler) =
            block_until(&runtime, deadline, Browser::launch(browser_config))?;
        let handler = runtime.spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        debug!("browser session started");

        Ok(Box::new(ChromiumSession {
            runtime,
            browser,
            page: None,
            handler: Some(handler),
            closed: false,
        }))
    }
}

struct ChromiumSession {
    runtime: Runtime,
    browser: Browser,
    page: Option<Page>,
    handler: Option<JoinHandle<()>>,
    closed: bool,
}

impl ChromiumSession {
    fn page(&self) -> Result<&Page, FetchFailure> {
        self.page
            .as_ref()
            .ok_or_else(|| FetchFailure::Session("no page has been opened".to_string()))
    }
}

const VISIBLE_TEXTS_JS: &str = r#"
function (selector) {
    const texts = Array.from(document.querySelectorAll(selector))
        .filter((el) => el.getClientRects().length > 0)
        .map((el) => (el.innerText || "").trim());
    return JSON.stringify(texts);
}
"#;

impl RenderSession for ChromiumSession {
    fn navigate(&mut self, url: &str, deadline: Instant) -> Result<(), FetchFailure> {
        let page = block_until(&self.runtime, deadline, self.browser.new_page(url))?;
        self.page = Some(page);
        Ok(())
    }

    fn visible_texts(
        &mut self,
        selector: &str,
        deadline: Instant,
    ) -> Result<Vec<String>, FetchFailure> {
        let quoted = serde_json::to_string(selector)
            .map_err(|err| FetchFailure::Request(format!("unusable selector {selector}: {err}")))?;
        let script = format!("({VISIBLE_TEXTS_JS})({quoted})");

        let page = self.page()?;
        let evaluated = block_until(&self.runtime, deadline, page.evaluate_expression(script))?;
        let json: String = evaluated
            .into_value()
            .map_err(|err| FetchFailure::Session(format!("unexpected script result: {err}")))?;
        serde_json::from_str(&json)
            .map_err(|err| FetchFailure::Session(format!("unexpected script result: {err}")))
    }

    fn content(&mut self, deadline: Instant) -> Result<String, FetchFailure> {
        let page = self.page()?;
        block_until(&self.runtime, deadline, page.content())
    }

    fn close(&mut self, deadline: Instant) -> Result<(), FetchFailure> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.page = None;

        let closed = block_until(&self.runtime, deadline, self.browser.close());
        let left = deadline.saturating_duration_since(Instant::now());
        let browser = &mut self.browser;
        let exited = self
            .runtime
            .block_on(async move { tokio::time::timeout(left, browser.wait()).await });
        if !matches!(exited, Ok(Ok(_))) {
            warn!("browser process did not exit cleanly");
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        debug!("browser session closed");

        closed.map(|_| ())
    }
}

fn remaining(deadline: Instant) -> Result<Duration, FetchFailure> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(FetchFailure::Timeout(Duration::ZERO));
    }
    Ok(left)
}

/// Drives `fut` to completion unless `deadline` passes first.
///
/// A missed deadline is reported as `Timeout(ZERO)`; the fetcher replaces it
/// with the budget it was enforcing.
fn block_until<F, T>(runtime: &Runtime, deadline: Instant, fut: F) -> Result<T, FetchFailure>
where
    F: Future<Output = Result<T, CdpError>>,
{
    let left = remaining(deadline)?;
    runtime
        .block_on(async { tokio::time::timeout(left, fut).await })
        .map_err(|_| FetchFailure::Timeout(Duration::ZERO))?
        .map_err(|err| FetchFailure::Session(err.to_string()))
}
