use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::catalog::estimate::OffsetEstimator;
use crate::catalog::window::WindowPolicy;

pub const DEFAULT_DB_PATH: &str = "data/classes.sqlite";

/// Traversal tunables. Every field has a default; a TOML file only needs the
/// keys it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Assumed catalog entries per calendar month.
    pub density: f64,
    /// Fraction of the estimated distance actually skipped.
    pub safety_factor: f64,
    /// Tiles to step back on entering the window or after an overshoot.
    pub backtrack_amount: usize,
    /// Consecutive too-old tiles tolerated before a newest-first run ends.
    pub exit_streak: u32,
    /// Consecutive interaction failures before the run is aborted.
    pub max_consecutive_failures: u32,
    /// Earliest month the catalog reaches back to.
    pub catalog_epoch: NaiveDate,
    /// Start dates before this year switch to oldest-first automatically.
    pub auto_oldest_first_before_year: Option<i32>,
    /// Record cap when neither dates nor an explicit cap are given.
    pub default_max_entries: usize,
    pub class_type: String,
    pub base_url: String,
    pub login_url: String,
    pub waits: WaitConfig,
    pub selectors: SelectorConfig,
    pub plan: PlanConfig,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            density: 27.0,
            safety_factor: 0.8,
            backtrack_amount: 20,
            exit_streak: 10,
            max_consecutive_failures: 5,
            catalog_epoch: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default(),
            auto_oldest_first_before_year: Some(2023),
            default_max_entries: 10,
            class_type: "Power Zone".to_string(),
            base_url: "https://members.onepeloton.com/classes/cycling".to_string(),
            login_url: "https://members.onepeloton.com/login".to_string(),
            waits: WaitConfig::default(),
            selectors: SelectorConfig::default(),
            plan: PlanConfig::default(),
        }
    }
}

impl TraversalConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.density > 0.0, "density must be positive");
        anyhow::ensure!(
            self.safety_factor > 0.0 && self.safety_factor < 1.0,
            "safety_factor must be in (0, 1)"
        );
        anyhow::ensure!(self.backtrack_amount > 0, "backtrack_amount must be at least 1");
        anyhow::ensure!(self.exit_streak > 0, "exit_streak must be at least 1");
        anyhow::ensure!(
            self.max_consecutive_failures > 0,
            "max_consecutive_failures must be at least 1"
        );
        for (name, limit) in &self.plan.instructor_limits {
            anyhow::ensure!(*limit > 0, "plan.instructor_limits for {} must be at least 1", name);
        }
        Ok(())
    }

    pub fn estimator(&self) -> OffsetEstimator {
        OffsetEstimator::new(self.density, self.safety_factor)
    }

    pub fn window_policy(&self) -> WindowPolicy {
        WindowPolicy {
            backtrack_amount: self.backtrack_amount,
            exit_streak: self.exit_streak,
        }
    }
}

/// Bounded waits, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub element_timeout_ms: u64,
    pub detail_timeout_ms: u64,
    pub fallback_timeout_ms: u64,
    pub scroll_settle_ms: u64,
    pub click_settle_ms: u64,
    pub page_settle_ms: u64,
    /// Multiplier on detail waits when a visible window is rendering.
    pub headed_slack: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            element_timeout_ms: 10_000,
            detail_timeout_ms: 12_000,
            fallback_timeout_ms: 12_000,
            scroll_settle_ms: 2_000,
            click_settle_ms: 1_000,
            page_settle_ms: 3_000,
            headed_slack: 1.5,
        }
    }
}

impl WaitConfig {
    fn scaled(&self, ms: u64, headless: bool) -> Duration {
        if headless {
            Duration::from_millis(ms)
        } else {
            Duration::from_millis((ms as f64 * self.headed_slack.max(1.0)) as u64)
        }
    }

    pub fn element(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn detail(&self, headless: bool) -> Duration {
        self.scaled(self.detail_timeout_ms, headless)
    }

    pub fn fallback(&self, headless: bool) -> Duration {
        self.scaled(self.fallback_timeout_ms, headless)
    }

    pub fn scroll_settle(&self) -> Duration {
        Duration::from_millis(self.scroll_settle_ms)
    }

    pub fn click_settle(&self) -> Duration {
        Duration::from_millis(self.click_settle_ms)
    }

    pub fn page_settle(&self) -> Duration {
        Duration::from_millis(self.page_settle_ms)
    }
}

/// CSS selectors for the catalog markup. The tile date class is generated by
/// the site's styling library and changes between deploys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub tile: String,
    pub tile_title: String,
    pub tile_date: String,
    pub detail_title: String,
    pub detail_subtitle: String,
    pub close_detail: String,
    pub filter_button: String,
    pub class_type_accordion: String,
    pub filter_close: String,
    pub login_user: String,
    pub login_password: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            tile: "[data-test-id='videoCell']".into(),
            tile_title: "[data-test-id='videoCellTitle']".into(),
            tile_date: "div.sc-fOlkSH".into(),
            detail_title: "[data-test-id='classDetailsTitle']".into(),
            detail_subtitle: "[data-test-id='classDetailsSubtitle']".into(),
            close_detail: "[data-test-id='closeModalButton']".into(),
            filter_button: "[data-test-id='filterButton']".into(),
            class_type_accordion: "button[id='accordion-button-ClassType']".into(),
            filter_close: "[data-test-id='filterCloseButton']".into(),
            login_user: "#usernameOrEmail".into(),
            login_password: "#password".into(),
        }
    }
}

/// Plan assembly rules. Both lists are empty unless configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Most slots any one instructor may fill in a plan.
    pub instructor_limits: BTreeMap<String, usize>,
    /// Instructors who must appear at least once.
    pub must_include: Vec<String>,
    /// How many final slots may be forced onto a missing must-include instructor.
    pub must_include_tail: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            instructor_limits: BTreeMap::new(),
            must_include: Vec::new(),
            must_include_tail: 10,
        }
    }
}
