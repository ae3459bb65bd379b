use anyhow::{Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::dom;
use crate::types::PageSnapshot;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longer than any single navigation so Chrome is not reaped mid-step.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(180);

/// Source of browser pages. One implementation is picked at startup.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acquire a fresh page for one session.
    async fn open(&self) -> Result<Box<dyn PageSession>>;
}

/// A single page owned by one session. `close` consumes it, so it can only
/// be released once.
#[async_trait]
pub trait PageSession: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;
    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()>;
    async fn snapshot(&mut self) -> Result<PageSnapshot>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Pick the backend for this deployment.
pub fn select_backend(config: &Config) -> Arc<dyn BrowserBackend> {
    if config.production {
        Arc::new(LaunchBackend::hardened())
    } else if let Some(ws_url) = &config.chrome_ws_url {
        Arc::new(AttachBackend::new(ws_url.clone()))
    } else {
        Arc::new(LaunchBackend::local())
    }
}

/// Run blocking headless_chrome work off the runtime, bounded by `timeout`.
async fn blocking<T, F>(timeout: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::time::timeout(timeout, tokio::task::spawn_blocking(work))
        .await
        .map_err(|_| anyhow!("browser call timed out after {timeout:?}"))?
        .map_err(|e| anyhow!("browser task panicked: {e}"))?
}

/// Launches a private headless Chrome per session.
pub struct LaunchBackend {
    /// Container-friendly flags for environments without a setuid sandbox.
    hardened: bool,
}

impl LaunchBackend {
    pub fn local() -> Self {
        Self { hardened: false }
    }

    pub fn hardened() -> Self {
        Self { hardened: true }
    }
}

#[async_trait]
impl BrowserBackend for LaunchBackend {
    fn name(&self) -> &'static str {
        if self.hardened { "launch-hardened" } else { "launch" }
    }

    async fn open(&self) -> Result<Box<dyn PageSession>> {
        let hardened = self.hardened;
        let (browser, tab) = blocking(LAUNCH_TIMEOUT, move || {
            let mut args = vec![
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--no-first-run"),
            ];
            if hardened {
                args.push(OsStr::new("--disable-setuid-sandbox"));
            }

            let options = LaunchOptions {
                headless: true,
                // false adds --no-sandbox
                sandbox: !hardened,
                args,
                idle_browser_timeout: IDLE_BROWSER_TIMEOUT,
                ..Default::default()
            };

            let browser =
                Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
            let tab = browser.new_tab()?;
            Ok((browser, tab))
        })
        .await?;

        info!(backend = self.name(), "browser launched");
        Ok(Box::new(ChromePage { browser, tab }))
    }
}

/// Opens tabs in a Chrome that is already running with remote debugging.
pub struct AttachBackend {
    ws_url: String,
}

impl AttachBackend {
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }
}

#[async_trait]
impl BrowserBackend for AttachBackend {
    fn name(&self) -> &'static str {
        "attach"
    }

    async fn open(&self) -> Result<Box<dyn PageSession>> {
        let ws_url = self.ws_url.clone();
        let (browser, tab) = blocking(LAUNCH_TIMEOUT, move || {
            let browser = Browser::connect(ws_url.clone())
                .map_err(|e| anyhow!("could not attach to Chrome at {ws_url}: {e}"))?;
            let tab = browser.new_tab()?;
            Ok((browser, tab))
        })
        .await?;

        info!(backend = self.name(), "attached to running browser");
        Ok(Box::new(ChromePage { browser, tab }))
    }
}

/// A tab plus the browser handle that keeps it alive. Dropping a launched
/// `Browser` kills its process; dropping an attached one only disconnects.
struct ChromePage {
    browser: Browser,
    tab: Arc<Tab>,
}

#[async_trait]
impl PageSession for ChromePage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let tab = self.tab.clone();
        let url = url.to_string();
        blocking(timeout, move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()> {
        let tab = self.tab.clone();
        blocking(timeout, move || {
            tab.set_default_timeout(timeout);
            tab.wait_until_navigated()?;
            tab.wait_for_element_with_custom_timeout("body", timeout)?;
            Ok(())
        })
        .await
    }

    async fn snapshot(&mut self) -> Result<PageSnapshot> {
        let tab = self.tab.clone();
        blocking(SNAPSHOT_TIMEOUT, move || dom::capture_snapshot(&tab)).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let ChromePage { browser, tab } = *self;
        let closed = blocking(SNAPSHOT_TIMEOUT, move || {
            tab.close(false)?;
            Ok(())
        })
        .await;
        drop(browser);
        debug!("browser page released");
        closed
    }
}
