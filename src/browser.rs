use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::agent::{now_ms, Action, AgentError, BrowserSession, PageState, SessionFactory};
use crate::config::{env_flag, env_or};

/// Regions of an Amazon page worth showing the model, in priority order.
pub const RELEVANT_SELECTORS: &[&str] = &["#nav-search-bar-form", "#search", ".s-main-slot", "#dp", "#productTitle"];
/// Upper bound on captured markup before reduction.
pub const MAX_CAPTURE_CHARS: usize = 60_000;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Attach to an already running Chrome instead of launching one.
    pub ws_url: Option<String>,
    pub viewport: (u32, u32),
    /// Pause after every executed action.
    pub slow_mo: Duration,
    /// Grace period after actions that may load a new document.
    pub settle_delay: Duration,
    pub capture_screenshots: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: env_flag("CART_PILOT_HEADLESS", false),
            user_agent: std::env::var("CART_PILOT_USER_AGENT").ok().filter(|v| !v.trim().is_empty()),
            ws_url: std::env::var("CHROME_WS_URL").ok().filter(|v| !v.trim().is_empty()),
            viewport: (1280, 800),
            slow_mo: Duration::from_millis(env_or("CART_PILOT_SLOW_MO_MS", 400)),
            settle_delay: Duration::from_millis(1_000),
            capture_screenshots: env_flag("CART_PILOT_SCREENSHOTS", false),
        }
    }
}

pub struct Browser {
    page: Page,
    browser: Mutex<OxideBrowser>,
    handler: JoinHandle<()>,
    /// Launched by us, as opposed to attached over `ws_url`.
    owned: bool,
    /// Temporary user-data dir of a launched browser, removed on close.
    profile_dir: Option<PathBuf>,
    /// Isolated context of an attached session, disposed on close.
    context: Option<BrowserContextId>,
}

impl Browser {
    pub async fn launch(cfg: &BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per session; concurrent runs must not share the singleton lock.
        let profile_dir = fresh_profile_dir().await?;
        builder = builder
            .user_data_dir(&profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let launched = match builder.build() {
            Ok(bcfg) => OxideBrowser::launch(bcfg).await.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow!(e)),
        };
        let (browser, mut handler) = match launched {
            Ok(pair) => pair,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });
        let mut session = match Self::with_page(browser, handler, None, cfg).await {
            Ok(session) => session,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };
        session.owned = true;
        session.profile_dir = Some(profile_dir);
        Ok(session)
    }

    /// Attaches over CDP and opens the tab in its own browser context, so
    /// cookies and storage stay apart from other sessions on the same Chrome.
    pub async fn connect(ws_url: &str, cfg: &BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });
        let context = browser.execute(CreateBrowserContextParams::default()).await?.result.browser_context_id;
        debug!(context = %context.inner(), "created browser context");
        Self::with_page(browser, handler, Some(context), cfg).await
    }

    async fn with_page(
        browser: OxideBrowser,
        handler: JoinHandle<()>,
        context: Option<BrowserContextId>,
        cfg: &BrowserConfig,
    ) -> Result<Self> {
        let page = browser.new_page(blank_target(context.as_ref())?).await?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        // Non-zero viewport, otherwise screenshots fail with 0-width errors.
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.viewport.0 as i64)
            .height(cfg.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        let _ = page.execute(metrics).await;
        Ok(Self { page, browser: Mutex::new(browser), handler, owned: false, profile_dir: None, context })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    pub async fn title(&self) -> Result<Option<String>> {
        Ok(self.page.get_title().await?)
    }

    /// Outer HTML of the relevant sections, each behind a `<!-- section: … -->`
    /// marker; sections nested in an earlier one are skipped. The whole
    /// document when none of them is present.
    pub async fn relevant_html(&self) -> Result<String> {
        let selectors = serde_json::to_string(RELEVANT_SELECTORS)?;
        let js = format!(
            r#"(() => {{
              const parts = [];
              const taken = [];
              for (const sel of {selectors}) {{
                const el = document.querySelector(sel);
                if (!el || taken.some(t => t.contains(el))) continue;
                taken.push(el);
                parts.push('<!-- section: ' + sel + ' -->\n' + el.outerHTML);
              }}
              const html = parts.length ? parts.join('\n') : document.documentElement.outerHTML;
              return html.slice(0, {MAX_CAPTURE_CHARS});
            }})()"#
        );
        let html: String = self.page.evaluate(js).await?.into_value()?;
        Ok(html)
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        self.page.find_element(selector).await?.click().await?;
        Ok(())
    }

    /// Replaces the field's current value with `text`.
    pub async fn type_into(&self, selector: &str, text: &str) -> Result<()> {
        let el = self.page.find_element(selector).await?;
        el.click().await?;
        let sel = serde_json::to_string(selector)?;
        self.eval_checked(
            format!("{selector} is not editable"),
            format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el) return false;
              if ('value' in el) el.value = '';
              el.focus();
              return true;
            }})()"#
            ),
        )
        .await?;
        el.type_str(text).await?;
        Ok(())
    }

    /// Presses `key` on `selector`, or on the focused element when no selector is given.
    pub async fn press(&self, selector: Option<&str>, key: &str) -> Result<()> {
        let el = match selector {
            Some(sel) => self.page.find_element(sel).await?,
            None => self
                .page
                .find_element(":focus")
                .await
                .map_err(|_| anyhow!("no focused element to press {key} on"))?,
        };
        el.press_key(key).await?;
        Ok(())
    }

    /// Picks the `<option>` whose value (or, failing that, visible text) matches.
    pub async fn select(&self, selector: &str, value: &str) -> Result<()> {
        let sel = serde_json::to_string(selector)?;
        let val = serde_json::to_string(value)?;
        self.eval_checked(
            format!("no option {value} in {selector}"),
            format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el || !el.options) return false;
              const want = {val};
              const opt = Array.from(el.options).find(o => o.value === want)
                || Array.from(el.options).find(o => o.text.trim() === want);
              if (!opt) return false;
              el.value = opt.value;
              el.dispatchEvent(new Event('input', {{ bubbles: true }}));
              el.dispatchEvent(new Event('change', {{ bubbles: true }}));
              return true;
            }})()"#
            ),
        )
        .await
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.page.evaluate(format!("window.scrollBy({dx}, {dy});")).await?;
        Ok(())
    }

    /// Polls until `selector` matches or `wait` elapses.
    pub async fn wait_for(&self, selector: &str, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(not_found(format!("{selector} did not appear within {}ms", wait.as_millis())));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        use chromiumoxide::page::ScreenshotParamsBuilder;
        let bytes = self
            .page
            .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
            .await?;
        Ok(STANDARD.encode(bytes))
    }

    pub async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        let closed = if self.owned {
            let closed = browser.close().await.map(|_| ());
            let _ = browser.wait().await;
            closed
        } else {
            // Attached sessions leave the user's browser running; only our tab and context go.
            let closed = self.page.clone().close().await;
            if let Some(id) = &self.context {
                if let Err(e) = browser.execute(DisposeBrowserContextParams::new(id.clone())).await {
                    warn!(context = %id.inner(), "disposing browser context failed: {e}");
                }
            }
            closed
        };
        self.handler.abort();
        if let Some(dir) = &self.profile_dir {
            remove_profile(dir).await;
        }
        closed?;
        Ok(())
    }

    /// Runs a script that reports success as a boolean.
    async fn eval_checked(&self, missing: String, js: String) -> Result<()> {
        let ok: bool = self.page.evaluate(js).await?.into_value()?;
        if ok {
            Ok(())
        } else {
            Err(not_found(missing))
        }
    }
}

fn not_found(message: String) -> anyhow::Error {
    anyhow::Error::new(CdpError::NotFound).context(message)
}

/// `about:blank` target, inside `context` when one is given.
fn blank_target(context: Option<&BrowserContextId>) -> Result<CreateTargetParams> {
    let mut target = CreateTargetParams::builder().url("about:blank");
    if let Some(id) = context {
        target = target.browser_context_id(id.clone());
    }
    target.build().map_err(|e| anyhow!(e))
}

async fn fresh_profile_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("cart-pilot-profile-{}-{}", std::process::id(), nanoid::nanoid!(8)));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

async fn remove_profile(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "removed browser profile"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "removing browser profile failed: {e}"),
    }
}

/// [`BrowserSession`] over one Chromium tab.
pub struct ChromiumSession {
    browser: Browser,
    cfg: BrowserConfig,
    closed: AtomicBool,
}

impl ChromiumSession {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, AgentError> {
        let browser = match &cfg.ws_url {
            Some(ws) => Browser::connect(ws, &cfg).await,
            None => Browser::launch(&cfg).await,
        }
        .map_err(|e| AgentError::Session(format!("{e:#}")))?;
        info!(headless = cfg.headless, attached = cfg.ws_url.is_some(), "browser session opened");
        Ok(Self { browser, cfg, closed: AtomicBool::new(false) })
    }

    async fn settle(&self, action: &Action) {
        if action.may_navigate() {
            sleep(self.cfg.settle_delay).await;
        }
        if !self.cfg.slow_mo.is_zero() {
            sleep(self.cfg.slow_mo).await;
        }
    }

    async fn dispatch(&self, action: &Action) -> Result<()> {
        match action {
            Action::Navigate { url } => self.browser.goto(url).await,
            Action::Click { selector } => self.browser.click(selector).await,
            Action::Type { selector, text } => self.browser.type_into(selector, text).await,
            Action::Press { selector, key } => self.browser.press(selector.as_deref(), key).await,
            Action::Select { selector, value } => self.browser.select(selector, value).await,
            Action::Scroll { dx, dy } => self.browser.scroll(*dx, *dy).await,
            Action::WaitFor { selector, timeout_ms } => {
                self.browser.wait_for(selector, Duration::from_millis(*timeout_ms)).await
            }
        }
    }
}

/// Transport failures mean the browser is gone; everything else is the action's fault.
fn classify(err: anyhow::Error) -> AgentError {
    let message = format!("{err:#}");
    match err.downcast_ref::<CdpError>() {
        Some(CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse | CdpError::Io(_)) => {
            AgentError::Session(message)
        }
        _ => AgentError::Execution(message),
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn open(&self, url: &str) -> Result<(), AgentError> {
        self.browser.goto(url).await.map_err(|e| AgentError::Session(format!("{e:#}")))?;
        sleep(self.cfg.settle_delay).await;
        Ok(())
    }

    async fn capture_page_state(&self) -> Result<PageState, AgentError> {
        let url = self.browser.url().await.map_err(classify_capture)?;
        let title = self.browser.title().await.map_err(classify_capture)?;
        let content = self.browser.relevant_html().await.map_err(classify_capture)?;
        let mut page = PageState::new(url, title, content);
        if self.cfg.capture_screenshots {
            match self.browser.screenshot_b64().await {
                Ok(b64) => page.image_base64 = Some(b64),
                Err(e) => warn!("screenshot failed: {e:#}"),
            }
        }
        page.captured_at_ms = now_ms();
        debug!(url = ?page.url, chars = page.content.len(), "page captured");
        Ok(page)
    }

    async fn execute(&self, action: &Action, limit: Duration) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Session("session already closed".into()));
        }
        match timeout(limit, self.dispatch(action)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(classify(err)),
            Err(_) => {
                return Err(AgentError::Execution(format!(
                    "{} timed out after {}ms",
                    action.kind(),
                    limit.as_millis()
                )))
            }
        }
        self.settle(action).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing browser session");
        self.browser.close().await.map_err(|e| AgentError::Session(format!("{e:#}")))
    }
}

/// A capture that fails leaves the loop blind, so it always ends the run.
fn classify_capture(err: anyhow::Error) -> AgentError {
    AgentError::Session(format!("capturing page state: {err:#}"))
}

/// Launches (or attaches) a fresh Chromium session per run.
pub struct ChromiumLauncher {
    cfg: BrowserConfig,
}

impl ChromiumLauncher {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl SessionFactory for ChromiumLauncher {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, AgentError> {
        Ok(Box::new(ChromiumSession::launch(self.cfg.clone()).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_end_the_session() {
        let err = classify(anyhow!(CdpError::NoResponse));
        assert!(matches!(err, AgentError::Session(_)));
    }

    #[test]
    fn lookup_errors_are_recoverable() {
        let err = classify(not_found("#missing did not appear within 5000ms".into()));
        assert!(matches!(err, AgentError::Execution(ref m) if m.contains("#missing")));
        let err = classify(anyhow!("no option x in select#s"));
        assert!(matches!(err, AgentError::Execution(_)));
    }

    #[test]
    fn attached_tabs_open_in_their_own_context() {
        let id = BrowserContextId::new("ctx-1");
        let target = blank_target(Some(&id)).unwrap();
        assert_eq!(target.url, "about:blank");
        assert_eq!(target.browser_context_id, Some(id));
        assert_eq!(blank_target(None).unwrap().browser_context_id, None);
    }

    #[tokio::test]
    async fn launched_profiles_are_removed() {
        let dir = fresh_profile_dir().await.unwrap();
        tokio::fs::write(dir.join("Local State"), b"{}").await.unwrap();
        tokio::fs::create_dir_all(dir.join("Default")).await.unwrap();
        assert!(dir.is_dir());
        remove_profile(&dir).await;
        assert!(!dir.exists());
        // A second removal is a quiet no-op.
        remove_profile(&dir).await;
    }

    #[test]
    fn relevant_selectors_start_with_the_search_form() {
        assert_eq!(RELEVANT_SELECTORS[0], "#nav-search-bar-form");
        assert!(RELEVANT_SELECTORS.contains(&"#productTitle"));
    }
}
