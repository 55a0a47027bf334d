use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog::extract::DetailSnapshot;
use crate::catalog::{deep_link, CatalogEntry, CatalogHost, Direction, HostError};
use crate::config::TraversalConfig;

const OLDEST_FIRST_QUERY: &str = "sort=original_air_time&desc=false";
const MAX_FRAGMENT_CHARS: usize = 40;

#[derive(Deserialize)]
struct TileText {
    title: String,
    date: Option<String>,
}

/// Catalog page driven through a Chrome session. Blocking; run it off the
/// async runtime.
pub struct ChromeHost {
    // Keeps the Chrome process alive for as long as the tab is used.
    browser: Browser,
    tab: Arc<Tab>,
    cfg: TraversalConfig,
    headless: bool,
}

/// Closes a short-lived tab however the read ends.
struct TabGuard(Arc<Tab>);

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.close(false) {
            debug!("Failed to close isolated tab: {}", e);
        }
    }
}

impl ChromeHost {
    pub fn launch(cfg: &TraversalConfig, headless: bool) -> Result<Self> {
        let options = LaunchOptions::default_builder()
            .headless(headless)
            .window_size(Some((1920, 1080)))
            .idle_browser_timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| anyhow!("Invalid browser options: {}", e))?;
        let browser = Browser::new(options).context("Failed to launch Chrome")?;
        let tab = browser.new_tab().context("Failed to open a tab")?;
        tab.set_default_timeout(cfg.waits.element());
        info!("Browser started ({})", if headless { "headless" } else { "headed" });
        Ok(Self { browser, tab, cfg: cfg.clone(), headless })
    }

    pub fn login(&self, email: &str, password: &str) -> Result<()> {
        let sel = &self.cfg.selectors;
        info!("Logging in as {}", email);
        self.tab.navigate_to(&self.cfg.login_url)?.wait_until_navigated()?;
        self.tab
            .wait_for_element(&sel.login_user)
            .context("Login form did not appear")?
            .click()?;
        self.tab.type_str(email)?;
        self.tab.find_element(&sel.login_password)?.click()?;
        self.tab.type_str(password)?;
        self.tab.press_key("Enter")?;
        sleep(self.cfg.waits.page_settle());
        self.tab.wait_until_navigated()?;
        if self.tab.get_url().contains("/login") {
            bail!("Login failed: still on the login page");
        }
        info!("Logged in");
        Ok(())
    }

    /// Load the catalog listing in `direction`, filtered to `class_type`.
    pub fn open_catalog(&self, class_type: &str, direction: Direction) -> Result<()> {
        let url = match direction {
            Direction::NewestFirst => self.cfg.base_url.clone(),
            Direction::OldestFirst => format!("{}?{}", self.cfg.base_url, OLDEST_FIRST_QUERY),
        };
        info!("Opening catalog {}", url);
        self.tab.navigate_to(&url)?.wait_until_navigated()?;
        sleep(self.cfg.waits.page_settle());
        self.apply_class_type_filter(class_type)
            .with_context(|| format!("Failed to filter catalog to {:?}", class_type))?;
        self.tab
            .wait_for_element(&self.cfg.selectors.tile)
            .context("No class tiles after filtering")?;
        Ok(())
    }

    fn apply_class_type_filter(&self, class_type: &str) -> Result<()> {
        let sel = &self.cfg.selectors;
        let settle = self.cfg.waits.click_settle();
        self.tab.wait_for_element(&sel.filter_button)?.click()?;
        sleep(settle);
        self.tab.wait_for_element(&sel.class_type_accordion)?.click()?;
        sleep(settle);
        let xpath = format!("//button[.//span[contains(text(), '{}')]]", class_type);
        self.tab.wait_for_xpath(&xpath)?.click()?;
        sleep(settle);
        self.tab.wait_for_element(&sel.filter_close)?.click()?;
        sleep(self.cfg.waits.page_settle());
        debug!("Filtered to {}", class_type);
        Ok(())
    }

    /// Evaluate `expr` (which must produce a JSON string) and decode it.
    fn eval_json<T: serde::de::DeserializeOwned>(tab: &Tab, expr: &str) -> Result<T> {
        let remote = tab.evaluate(expr, false)?;
        let text = remote
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Script returned no JSON text"))?;
        Ok(serde_json::from_str(text)?)
    }

    fn tiles_script(&self) -> String {
        let sel = &self.cfg.selectors;
        format!(
            "JSON.stringify(Array.from(document.querySelectorAll({tile})).map(t => {{
                const title = t.querySelector({title});
                const date = t.querySelector({date});
                return {{
                    title: title ? title.innerText.trim() : '',
                    date: date ? date.innerText.trim() : null
                }};
            }}))",
            tile = js_str(&sel.tile),
            title = js_str(&sel.tile_title),
            date = js_str(&sel.tile_date),
        )
    }

    fn detail_script(&self) -> String {
        let sel = &self.cfg.selectors;
        format!(
            "(() => {{
                const titleEl = document.querySelector({title});
                const subEl = document.querySelector({subtitle});
                const root = (titleEl && titleEl.closest('[role=\"dialog\"]')) || document.body;
                const fragments = Array.from(root.querySelectorAll('span, p'))
                    .map(e => e.innerText ? e.innerText.trim() : '')
                    .filter(t => t.length > 0 && t.length <= {max});
                return JSON.stringify({{
                    title: titleEl ? titleEl.innerText.trim() : null,
                    subtitle: subEl ? subEl.innerText.trim() : null,
                    fragments
                }});
            }})()",
            title = js_str(&sel.detail_title),
            subtitle = js_str(&sel.detail_subtitle),
            max = MAX_FRAGMENT_CHARS,
        )
    }

    fn snapshot_detail(&self, tab: &Tab, timeout: Duration) -> Result<DetailSnapshot, HostError> {
        tab.wait_for_element_with_custom_timeout(&self.cfg.selectors.detail_title, timeout)
            .map_err(|e| classify(e, "detail view"))?;
        Self::eval_json(tab, &self.detail_script()).map_err(|e| classify(e, "detail text"))
    }
}

impl CatalogHost for ChromeHost {
    fn list_entries(&mut self) -> Result<Vec<CatalogEntry>, HostError> {
        let tiles: Vec<TileText> =
            Self::eval_json(&self.tab, &self.tiles_script()).map_err(|e| classify(e, "tile list"))?;
        Ok(tiles
            .into_iter()
            .enumerate()
            .map(|(index, t)| CatalogEntry {
                index,
                raw_date: t.date.filter(|d| !d.is_empty()),
                title: t.title,
            })
            .collect())
    }

    fn request_more(&mut self) -> Result<bool, HostError> {
        self.tab
            .evaluate("window.scrollTo(0, document.body.scrollHeight)", false)
            .map_err(|e| classify(e, "scroll"))?;
        sleep(self.cfg.waits.scroll_settle());
        Ok(true)
    }

    fn open_entry(&mut self, entry: &CatalogEntry) -> Result<String, HostError> {
        let tiles = self
            .tab
            .find_elements(&self.cfg.selectors.tile)
            .map_err(|e| classify(e, "class tiles"))?;
        let tile = tiles.get(entry.index).ok_or_else(|| {
            HostError::StaleReference(format!("tile {} no longer rendered", entry.index + 1))
        })?;
        tile.scroll_into_view().map_err(|e| classify(e, "tile scroll"))?;
        tile.click().map_err(|e| classify(e, "tile click"))?;
        sleep(self.cfg.waits.click_settle());

        let url = self.tab.get_url();
        if url.contains("/login") {
            return Err(HostError::SessionExpired);
        }
        Ok(url)
    }

    fn read_detail(&mut self) -> Result<DetailSnapshot, HostError> {
        let timeout = self.cfg.waits.detail(self.headless);
        self.snapshot_detail(&self.tab, timeout)
    }

    fn read_detail_isolated(&mut self, class_id: &str) -> Result<DetailSnapshot, HostError> {
        let url = deep_link(&self.cfg.base_url, class_id);
        debug!("Opening isolated view {}", url);
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| HostError::Navigation(format!("new tab: {}", e)))?;
        let guard = TabGuard(tab);
        guard
            .0
            .navigate_to(&url)
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| classify(e, "deep link"))?;
        if guard.0.get_url().contains("/login") {
            return Err(HostError::SessionExpired);
        }
        self.snapshot_detail(&guard.0, self.cfg.waits.fallback(self.headless))
    }

    fn close_entry(&mut self) -> Result<(), HostError> {
        match self.tab.find_element(&self.cfg.selectors.close_detail) {
            Ok(button) => {
                button.click().map_err(|e| classify(e, "close button"))?;
            }
            Err(_) => {
                self.tab
                    .press_key("Escape")
                    .map_err(|e| classify(e, "escape key"))?;
            }
        }
        sleep(self.cfg.waits.click_settle());
        Ok(())
    }
}

/// Map a browser error onto the host error taxonomy.
fn classify(e: anyhow::Error, what: &str) -> HostError {
    let msg = format!("{:#}", e);
    let lower = msg.to_lowercase();
    if lower.contains("never came") || lower.contains("timeout") || lower.contains("timed out") {
        HostError::Timeout(what.to_string())
    } else if lower.contains("node with given id") || lower.contains("no node") || lower.contains("detached") {
        HostError::StaleReference(format!("{}: {}", what, msg))
    } else if lower.contains("connection") && lower.contains("closed") {
        warn!("Browser connection lost: {}", msg);
        HostError::Navigation(format!("{}: {}", what, msg))
    } else {
        HostError::Interaction(format!("{}: {}", what, msg))
    }
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "''".to_string())
}
