use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::extract::{extract_fields, DetailSnapshot};
use super::tile_date::parse_tile_date;
use super::window::{Decision, WindowState, WindowTracker};
use super::{
    class_id_from_url, deep_link, CatalogEntry, CatalogHost, ClassRecord, DateWindow, Direction,
    HostError, RecordSink,
};
use crate::config::TraversalConfig;

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("aborted after {failures} consecutive interaction failures (last: {last})")]
    RunAborted { failures: u32, last: HostError },
    #[error(transparent)]
    Host(HostError),
    #[error("failed to persist class {id}: {reason}")]
    Persist { id: String, reason: String },
}

#[derive(Debug)]
pub enum StopReason {
    /// Travelled past the far edge of the window.
    WindowExited,
    EndOfCatalog,
    LimitReached,
    Interrupted,
    Aborted(TraversalError),
}

/// What one traversal run is asked to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub window: DateWindow,
    pub direction: Direction,
    pub max_entries: Option<usize>,
    pub class_type: String,
    /// Reference date for newest-first offset estimates.
    pub today: NaiveDate,
}

#[derive(Debug)]
pub struct RunSummary {
    pub extracted: usize,
    pub skipped_out_of_range: usize,
    pub skipped_failed: usize,
    pub duplicates: usize,
    pub dateless: usize,
    pub last_dated: Option<NaiveDate>,
    pub direction: Direction,
    pub window: DateWindow,
    pub max_entries: Option<usize>,
    pub stop: StopReason,
}

impl RunSummary {
    /// Ended before the window or the catalog was exhausted.
    pub fn stopped_early(&self) -> bool {
        matches!(self.stop, StopReason::Interrupted | StopReason::Aborted(_))
    }

    /// `scrape` arguments that pick up where this run left off: the bound
    /// already covered moves to the last dated class, the other bound, the
    /// direction and the remaining cap are carried over.
    pub fn resume_hint(&self) -> Option<String> {
        if !self.stopped_early() {
            return None;
        }
        let resume_from = self.last_dated?;
        let (start, end) = match self.direction {
            Direction::NewestFirst => (self.window.start, Some(resume_from)),
            Direction::OldestFirst => (Some(resume_from), self.window.end),
        };

        let mut args = Vec::new();
        if let Some(start) = start {
            args.push(format!("--start-date {}", start));
        }
        if let Some(end) = end {
            args.push(format!("--end-date {}", end));
        }
        if self.direction == Direction::OldestFirst {
            args.push("--oldest-first".to_string());
        }
        if let Some(max) = self.max_entries {
            args.push(format!("--max {}", max.saturating_sub(self.extracted).max(1)));
        }
        Some(args.join(" "))
    }

    /// `command` is the invocation prefix the resume hint is appended to.
    pub fn print(&self, command: &str) {
        println!(
            "Extracted {} classes ({} out of range skipped, {} failed, {} duplicates, {} without a date).",
            self.extracted, self.skipped_out_of_range, self.skipped_failed, self.duplicates, self.dateless
        );
        match &self.stop {
            StopReason::WindowExited => println!("Stopped: left the requested date range."),
            StopReason::EndOfCatalog => println!("Stopped: no more classes in the catalog."),
            StopReason::LimitReached => println!("Stopped: reached the class limit."),
            StopReason::Interrupted => println!("Stopped: interrupted."),
            StopReason::Aborted(e) => println!("Aborted: {}", e),
        }
        if let Some(hint) = self.resume_hint() {
            println!("Saved classes are kept. To resume, run:");
            println!("  {} scrape {}", command, hint);
        }
    }
}

/// Per-run state, dropped when the run ends.
struct TraversalState {
    offset: usize,
    processed: HashSet<String>,
    consecutive_failures: u32,
    tracker: WindowTracker,
    /// Last tile an overshooting skip was pulled back onto.
    clamped_to: Option<usize>,
}

/// Outcome of handling a single tile.
enum Step {
    Continue,
    Stop(StopReason),
}

pub struct Traversal<'a, H, S> {
    host: &'a mut H,
    sink: &'a mut S,
    cfg: &'a TraversalConfig,
    request: &'a RunRequest,
    interrupt: &'a AtomicBool,
}

impl<'a, H: CatalogHost, S: RecordSink> Traversal<'a, H, S> {
    pub fn new(
        host: &'a mut H,
        sink: &'a mut S,
        cfg: &'a TraversalConfig,
        request: &'a RunRequest,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self { host, sink, cfg, request, interrupt }
    }

    /// Offset the run starts from, estimated from the near window boundary.
    pub fn initial_offset(&self) -> usize {
        let estimator = self.cfg.estimator();
        match self.request.direction {
            Direction::NewestFirst => self
                .request
                .window
                .end
                .map_or(0, |end| estimator.initial_offset(self.request.today, end)),
            Direction::OldestFirst => self
                .request
                .window
                .start
                .map_or(0, |start| estimator.initial_offset(self.cfg.catalog_epoch, start)),
        }
    }

    pub fn run(mut self) -> RunSummary {
        let mut summary = RunSummary {
            extracted: 0,
            skipped_out_of_range: 0,
            skipped_failed: 0,
            duplicates: 0,
            dateless: 0,
            last_dated: None,
            direction: self.request.direction,
            window: self.request.window,
            max_entries: self.request.max_entries,
            stop: StopReason::EndOfCatalog,
        };
        let mut state = TraversalState {
            offset: self.initial_offset(),
            processed: HashSet::new(),
            consecutive_failures: 0,
            clamped_to: None,
            tracker: WindowTracker::new(
                self.request.window,
                self.request.direction,
                self.cfg.window_policy(),
                self.cfg.estimator(),
            ),
        };
        if state.offset > 0 {
            info!("Fast-forwarding to tile {} to approach the date range", state.offset);
        }

        let stop = loop {
            if self.interrupt.load(Ordering::Relaxed) {
                break StopReason::Interrupted;
            }
            if self.request.max_entries.is_some_and(|max| summary.extracted >= max) {
                break StopReason::LimitReached;
            }
            match self.step(&mut state, &mut summary) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop(reason)) => break reason,
                Err(e) if e.is_fatal() => break StopReason::Aborted(TraversalError::Host(e)),
                Err(e) => {
                    state.consecutive_failures += 1;
                    warn!(
                        "Interaction failure at tile {} ({}/{}): {}",
                        state.offset + 1,
                        state.consecutive_failures,
                        self.cfg.max_consecutive_failures,
                        e
                    );
                    if state.consecutive_failures >= self.cfg.max_consecutive_failures {
                        break StopReason::Aborted(TraversalError::RunAborted {
                            failures: state.consecutive_failures,
                            last: e,
                        });
                    }
                }
            }
        };

        summary.stop = stop;
        info!(
            "Traversal finished: {} extracted, {} skipped out of range, window {:?}",
            summary.extracted,
            summary.skipped_out_of_range,
            state.tracker.state()
        );
        summary
    }

    /// Handle the tile at the current offset.
    fn step(&mut self, state: &mut TraversalState, summary: &mut RunSummary) -> Result<Step, HostError> {
        let mut entries = self.load_through(state.offset)?;
        if state.offset >= entries.len() {
            let Some(last) = entries.len().checked_sub(1) else {
                info!("The catalog shows no classes");
                return Ok(Step::Stop(StopReason::EndOfCatalog));
            };
            // An estimate can overshoot the whole catalog while still
            // approaching the window; check the last tile before giving up.
            if state.tracker.state() != WindowState::Before || state.clamped_to == Some(last) {
                info!("No more classes available past tile {}", entries.len());
                return Ok(Step::Stop(StopReason::EndOfCatalog));
            }
            info!(
                "Skip to tile {} ran past the last loaded tile; checking tile {} instead",
                state.offset + 1,
                last + 1
            );
            state.clamped_to = Some(last);
            state.offset = last;
        }
        let entry = entries.swap_remove(state.offset);

        let date = match entry.raw_date.as_deref().map(parse_tile_date) {
            Some(Ok(date)) => Some(date),
            Some(Err(e)) => {
                warn!("{}; processing tile {} without a date", e, entry.index + 1);
                None
            }
            None => {
                warn!("Tile {} has no date label; processing anyway", entry.index + 1);
                None
            }
        };

        match state.tracker.observe(state.offset, date) {
            Decision::Skip(n) => {
                summary.skipped_out_of_range += 1;
                state.consecutive_failures = 0;
                state.offset += n;
                Ok(Step::Continue)
            }
            Decision::Backtrack(n) => {
                if state.tracker.state() == WindowState::Inside {
                    info!("Entered date range at tile {}; backing up {} tiles", state.offset + 1, n);
                } else {
                    info!("Overshot the date range at tile {}; backing up {} tiles", state.offset + 1, n);
                }
                state.consecutive_failures = 0;
                state.offset = state.offset.saturating_sub(n);
                Ok(Step::Continue)
            }
            Decision::Stop => Ok(Step::Stop(StopReason::WindowExited)),
            Decision::Process => {
                let result = self.process(&entry, date, state, summary);
                state.offset += 1;
                if let Err(e) = &result {
                    if !e.is_fatal() {
                        warn!("Skipping tile {}: {}", entry.index + 1, e);
                        summary.skipped_failed += 1;
                        self.close();
                    }
                }
                result
            }
        }
    }

    /// Fresh tile snapshot, loading more tiles until `offset` is covered or
    /// the host stops producing new ones.
    fn load_through(&mut self, offset: usize) -> Result<Vec<CatalogEntry>, HostError> {
        let mut entries = self.host.list_entries()?;
        while offset >= entries.len() {
            debug!("Need tile {} but only {} loaded; requesting more", offset + 1, entries.len());
            let loaded = entries.len();
            if !self.host.request_more()? {
                break;
            }
            entries = self.host.list_entries()?;
            if entries.len() <= loaded {
                break;
            }
        }
        Ok(entries)
    }

    fn process(
        &mut self,
        entry: &CatalogEntry,
        date: Option<NaiveDate>,
        state: &mut TraversalState,
        summary: &mut RunSummary,
    ) -> Result<Step, HostError> {
        let url = self.host.open_entry(entry)?;
        let class_id = class_id_from_url(&url);

        if class_id.is_empty() || state.processed.contains(&class_id) {
            debug!("Class {:?} already processed, skipping", class_id);
            summary.duplicates += 1;
            self.close();
            return Ok(Step::Continue);
        }

        let Some(detail) = self.read_detail(&class_id)? else {
            warn!("Skipping class {}: detail view never stabilized", class_id);
            summary.skipped_failed += 1;
            self.close();
            return Ok(Step::Continue);
        };

        let fields = extract_fields(&detail, &entry.title);
        if fields.duration_minutes.is_none() {
            warn!("Duration not found for {}", class_id);
        }
        if fields.difficulty_rating.is_none() {
            warn!("Difficulty rating not found for {}", class_id);
        }

        let record = ClassRecord {
            url: deep_link(&self.cfg.base_url, &class_id),
            id: class_id,
            title: fields.title,
            instructor: fields.instructor,
            duration_minutes: fields.duration_minutes,
            difficulty_rating: fields.difficulty_rating,
            class_type: self.request.class_type.clone(),
            original_air_time: date,
        };

        if let Err(e) = self.sink.persist(&record) {
            self.close();
            return Ok(Step::Stop(StopReason::Aborted(TraversalError::Persist {
                id: record.id,
                reason: format!("{:#}", e),
            })));
        }

        summary.extracted += 1;
        match date {
            Some(d) => summary.last_dated = Some(d),
            None => summary.dateless += 1,
        }
        state.consecutive_failures = 0;
        state.processed.insert(record.id);
        self.close();
        Ok(Step::Continue)
    }

    /// In-place detail first, then the isolated deep-link view. `None` when
    /// both time out or go stale; fatal errors still propagate.
    fn read_detail(&mut self, class_id: &str) -> Result<Option<DetailSnapshot>, HostError> {
        match self.host.read_detail() {
            Ok(detail) => return Ok(Some(detail)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Detail view not stable ({}); trying deep link for {}", e, class_id),
        }
        match self.host.read_detail_isolated(class_id) {
            Ok(detail) => Ok(Some(detail)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Deep-link fallback failed for {}: {}", class_id, e);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.host.close_entry() {
            warn!("Could not close detail view: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[derive(Clone)]
    struct Tile {
        id: String,
        label: Option<String>,
        title: String,
    }

    /// In-memory catalog that loads `page` tiles per scroll.
    struct FakeHost {
        tiles: Vec<Tile>,
        loaded: usize,
        page: usize,
        open: Option<usize>,
        opened: Vec<usize>,
        isolated: Vec<String>,
        closes: usize,
        /// Scripted failures, consumed per call.
        open_errors: VecDeque<Option<HostError>>,
        detail_timeouts: HashMap<String, bool>,
        list_errors: VecDeque<HostError>,
    }

    impl FakeHost {
        fn new(tiles: Vec<Tile>, page: usize) -> Self {
            Self {
                loaded: page.min(tiles.len()),
                tiles,
                page,
                open: None,
                opened: Vec::new(),
                isolated: Vec::new(),
                closes: 0,
                open_errors: VecDeque::new(),
                detail_timeouts: HashMap::new(),
                list_errors: VecDeque::new(),
            }
        }

        fn snapshot(&self, idx: usize) -> DetailSnapshot {
            let t = &self.tiles[idx];
            DetailSnapshot {
                title: Some(t.title.clone()),
                subtitle: Some("DENIS MORTON · Cycling".into()),
                fragments: vec!["45 min".into(), "120+".into(), "7.5".into()],
            }
        }
    }

    impl CatalogHost for FakeHost {
        fn list_entries(&mut self) -> Result<Vec<CatalogEntry>, HostError> {
            if let Some(e) = self.list_errors.pop_front() {
                return Err(e);
            }
            Ok(self.tiles[..self.loaded]
                .iter()
                .enumerate()
                .map(|(index, t)| CatalogEntry {
                    index,
                    raw_date: t.label.clone(),
                    title: t.title.clone(),
                })
                .collect())
        }

        fn request_more(&mut self) -> Result<bool, HostError> {
            self.loaded = (self.loaded + self.page).min(self.tiles.len());
            Ok(true)
        }

        fn open_entry(&mut self, entry: &CatalogEntry) -> Result<String, HostError> {
            if let Some(Some(e)) = self.open_errors.pop_front() {
                return Err(e);
            }
            self.open = Some(entry.index);
            self.opened.push(entry.index);
            Ok(format!("https://x/classes/cycling?modal=classDetailsModal&classId={}", self.tiles[entry.index].id))
        }

        fn read_detail(&mut self) -> Result<DetailSnapshot, HostError> {
            let idx = self.open.expect("detail read without open entry");
            if self.detail_timeouts.contains_key(&self.tiles[idx].id) {
                return Err(HostError::Timeout("detail title".into()));
            }
            Ok(self.snapshot(idx))
        }

        fn read_detail_isolated(&mut self, class_id: &str) -> Result<DetailSnapshot, HostError> {
            self.isolated.push(class_id.to_string());
            match self.detail_timeouts.get(class_id) {
                Some(true) => Err(HostError::Timeout("deep link".into())),
                _ => {
                    let idx = self.tiles.iter().position(|t| t.id == class_id).unwrap();
                    Ok(self.snapshot(idx))
                }
            }
        }

        fn close_entry(&mut self) -> Result<(), HostError> {
            self.open = None;
            self.closes += 1;
            Ok(())
        }
    }

    /// Newest-first catalog with `per_day` classes per day, from `newest`
    /// back `days` days.
    fn daily_catalog(newest: NaiveDate, days: i64, per_day: usize) -> Vec<Tile> {
        let mut tiles = Vec::new();
        for back in 0..days {
            let date = newest - chrono::Duration::days(back);
            for n in 0..per_day {
                tiles.push(Tile {
                    id: format!("{}-{}", date.format("%Y%m%d"), n),
                    label: Some(format!("{} {} @ 6:00 AM", date.format("%a"), date.format("%m/%d/%y"))),
                    title: format!("{} min Power Zone Ride", 30 + 15 * n),
                });
            }
        }
        tiles
    }

    fn request(window: DateWindow, direction: Direction, max: Option<usize>, today: NaiveDate) -> RunRequest {
        RunRequest {
            window,
            direction,
            max_entries: max,
            class_type: "Power Zone".into(),
            today,
        }
    }

    fn run(host: &mut FakeHost, req: &RunRequest, cfg: &TraversalConfig) -> (RunSummary, Vec<ClassRecord>) {
        let mut saved = Vec::new();
        let interrupt = AtomicBool::new(false);
        let mut sink = |r: &ClassRecord| -> anyhow::Result<()> {
            saved.push(r.clone());
            Ok(())
        };
        let summary = Traversal::new(host, &mut sink, cfg, req, &interrupt).run();
        (summary, saved)
    }

    #[test]
    fn unbounded_run_stops_at_limit() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 30, 1), 8);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, Some(12), d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert!(matches!(summary.stop, StopReason::LimitReached));
        assert_eq!(summary.extracted, 12);
        assert_eq!(saved.len(), 12);
        assert_eq!(host.opened, (0..12).collect::<Vec<_>>());
        assert!(host.isolated.is_empty());

        let first = &saved[0];
        assert_eq!(first.id, "20250630-0");
        assert_eq!(first.instructor, "DENIS MORTON");
        assert_eq!(first.duration_minutes, Some(45));
        assert_eq!(first.difficulty_rating, Some(7.5));
        assert_eq!(first.original_air_time, Some(d(2025, 6, 30)));
        assert_eq!(first.class_type, "Power Zone");
        assert!(first.url.ends_with("classId=20250630-0"));
    }

    #[test]
    fn unbounded_run_reaches_end_of_catalog() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 7, 1), 3);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
        assert_eq!(saved.len(), 7);
        assert_eq!(summary.skipped_out_of_range, 0);
        assert!(summary.resume_hint().is_none());
    }

    #[test]
    fn newest_first_window_collects_exactly_the_range() {
        // One class per day from mid-October 2025 back to the start of 2025.
        let mut host = FakeHost::new(daily_catalog(d(2025, 10, 15), 288, 1), 25);
        let cfg = TraversalConfig::default();
        let window = DateWindow::new(Some(d(2025, 3, 1)), Some(d(2025, 3, 31)));
        let req = request(window, Direction::NewestFirst, None, d(2025, 10, 15));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert!(matches!(summary.stop, StopReason::WindowExited), "{:?}", summary.stop);
        assert_eq!(saved.len(), 31);
        assert!(saved.iter().all(|r| window.contains(r.original_air_time.unwrap())));
        let ids: HashSet<_> = saved.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 31);
        assert!(summary.skipped_out_of_range > 0);
        assert_eq!(summary.last_dated, Some(d(2025, 3, 1)));
    }

    #[test]
    fn oldest_first_window_collects_exactly_the_range() {
        let mut tiles = daily_catalog(d(2020, 6, 30), 180, 2);
        tiles.reverse();
        let mut host = FakeHost::new(tiles, 40);
        let cfg = TraversalConfig { catalog_epoch: d(2020, 1, 1), ..Default::default() };
        let window = DateWindow::new(Some(d(2020, 4, 10)), Some(d(2020, 4, 20)));
        let req = request(window, Direction::OldestFirst, None, d(2025, 1, 1));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert!(matches!(summary.stop, StopReason::WindowExited), "{:?}", summary.stop);
        assert_eq!(saved.len(), 22);
        assert!(saved.iter().all(|r| window.contains(r.original_air_time.unwrap())));
    }

    #[test]
    fn dateless_tiles_are_processed() {
        let mut tiles = daily_catalog(d(2025, 3, 20), 3, 1);
        tiles[1].label = Some("Wed 03/19/25 6:00 AM".into());
        tiles[2].label = None;
        let mut host = FakeHost::new(tiles, 10);
        let cfg = TraversalConfig::default();
        let window = DateWindow::new(Some(d(2025, 3, 1)), Some(d(2025, 3, 31)));
        let req = request(window, Direction::NewestFirst, None, d(2025, 3, 20));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 3);
        assert_eq!(summary.dateless, 2);
        assert_eq!(saved[1].original_air_time, None);
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn detail_timeout_uses_isolated_fallback() {
        let tiles = daily_catalog(d(2025, 6, 30), 3, 1);
        let mut host = FakeHost::new(tiles, 10);
        host.detail_timeouts.insert("20250629-0".into(), false);
        host.detail_timeouts.insert("20250628-0".into(), true);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(host.isolated, vec!["20250629-0".to_string(), "20250628-0".to_string()]);
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].id, "20250629-0");
        assert_eq!(summary.skipped_failed, 1);
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn repeated_stale_failures_abort_but_keep_records() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 20, 1), 20);
        host.open_errors = [None, None, None]
            .into_iter()
            .chain((0..5).map(|i| Some(HostError::StaleReference(format!("node {}", i)))))
            .collect();
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 3);
        assert!(matches!(
            summary.stop,
            StopReason::Aborted(TraversalError::RunAborted { failures: 5, .. })
        ));
        assert!(summary.stopped_early());
        assert_eq!(summary.skipped_failed, 5);
        // Three saved classes plus a close attempt after every failed open.
        assert_eq!(host.closes, 8);
        assert_eq!(summary.resume_hint().as_deref(), Some("--end-date 2025-06-28"));
    }

    #[test]
    fn failed_open_counts_as_skipped_and_moves_on() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 4, 1), 10);
        host.open_errors = [None, Some(HostError::Interaction("not clickable".into()))]
            .into_iter()
            .collect();
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 3);
        assert_eq!(summary.skipped_failed, 1);
        assert!(saved.iter().all(|r| r.id != "20250629-0"));
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn resume_hint_keeps_the_far_bound_direction_and_cap() {
        let mut tiles = daily_catalog(d(2020, 6, 30), 180, 1);
        tiles.reverse();
        let mut host = FakeHost::new(tiles, 40);
        let cfg = TraversalConfig { catalog_epoch: d(2020, 1, 1), ..Default::default() };
        let window = DateWindow::new(Some(d(2020, 4, 1)), Some(d(2020, 4, 30)));
        let req = request(window, Direction::OldestFirst, Some(20), d(2025, 1, 1));
        let interrupt = AtomicBool::new(false);
        let mut calls = 0;
        let mut sink = |_: &ClassRecord| -> anyhow::Result<()> {
            calls += 1;
            if calls == 3 {
                interrupt.store(true, Ordering::Relaxed);
            }
            Ok(())
        };
        let summary = Traversal::new(&mut host, &mut sink, &cfg, &req, &interrupt).run();

        assert!(matches!(summary.stop, StopReason::Interrupted));
        assert_eq!(summary.extracted, 3);
        assert_eq!(
            summary.resume_hint().as_deref(),
            Some("--start-date 2020-04-03 --end-date 2020-04-30 --oldest-first --max 17")
        );
    }

    #[test]
    fn skip_past_a_sparse_catalog_falls_back_onto_the_last_tile() {
        // One class every other day, about fifteen a month: the density
        // estimate lands far past the 60 tiles that exist.
        let newest = d(2025, 10, 15);
        let tiles: Vec<Tile> = (0..60)
            .map(|i| {
                let date = newest - chrono::Duration::days(2 * i);
                Tile {
                    id: format!("sparse-{}", i),
                    label: Some(format!("{} {} @ 6:00 AM", date.format("%a"), date.format("%m/%d/%y"))),
                    title: "45 min Power Zone Ride".into(),
                }
            })
            .collect();
        let mut host = FakeHost::new(tiles, 25);
        let cfg = TraversalConfig::default();
        let window = DateWindow::new(Some(d(2025, 6, 20)), Some(d(2025, 6, 30)));
        let req = request(window, Direction::NewestFirst, None, newest);
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 5, "{:?}", summary.stop);
        assert!(saved.iter().all(|r| window.contains(r.original_air_time.unwrap())));
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn catalog_entirely_newer_than_window_ends_cleanly() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 10, 15), 20, 1), 10);
        let cfg = TraversalConfig::default();
        let window = DateWindow::new(Some(d(2025, 3, 1)), Some(d(2025, 3, 31)));
        let req = request(window, Direction::NewestFirst, None, d(2025, 10, 15));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert!(saved.is_empty());
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn failures_below_threshold_are_absorbed() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 6, 1), 10);
        host.list_errors = (0..4).map(|_| HostError::Timeout("tiles".into())).collect();
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 6);
        assert!(matches!(summary.stop, StopReason::EndOfCatalog));
    }

    #[test]
    fn session_expiry_aborts_immediately() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 6, 1), 10);
        host.open_errors = [None, Some(HostError::SessionExpired)].into_iter().collect();
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 1);
        assert!(matches!(
            summary.stop,
            StopReason::Aborted(TraversalError::Host(HostError::SessionExpired))
        ));
    }

    #[test]
    fn duplicate_ids_within_run_are_saved_once() {
        let mut tiles = daily_catalog(d(2025, 6, 30), 4, 1);
        tiles[2].id = tiles[1].id.clone();
        let mut host = FakeHost::new(tiles, 10);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let (summary, saved) = run(&mut host, &req, &cfg);

        assert_eq!(saved.len(), 3);
        assert_eq!(summary.duplicates, 1);
    }

    #[test]
    fn sink_failure_aborts_run() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 4, 1), 10);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let interrupt = AtomicBool::new(false);
        let mut calls = 0;
        let mut sink = |_: &ClassRecord| -> anyhow::Result<()> {
            calls += 1;
            if calls == 2 {
                anyhow::bail!("disk full");
            }
            Ok(())
        };
        let summary = Traversal::new(&mut host, &mut sink, &cfg, &req, &interrupt).run();

        assert_eq!(summary.extracted, 1);
        assert!(matches!(summary.stop, StopReason::Aborted(TraversalError::Persist { .. })));
    }

    #[test]
    fn interrupt_flag_stops_before_next_tile() {
        let mut host = FakeHost::new(daily_catalog(d(2025, 6, 30), 4, 1), 10);
        let cfg = TraversalConfig::default();
        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 6, 30));
        let interrupt = AtomicBool::new(false);
        let mut sink = |_: &ClassRecord| -> anyhow::Result<()> {
            interrupt.store(true, Ordering::Relaxed);
            Ok(())
        };
        let summary = Traversal::new(&mut host, &mut sink, &cfg, &req, &interrupt).run();

        assert_eq!(summary.extracted, 1);
        assert!(matches!(summary.stop, StopReason::Interrupted));
        assert_eq!(summary.resume_hint().as_deref(), Some("--end-date 2025-06-30"));
    }

    #[test]
    fn initial_offset_targets_near_boundary() {
        let mut host = FakeHost::new(Vec::new(), 1);
        let mut sink = |_: &ClassRecord| -> anyhow::Result<()> { Ok(()) };
        let cfg = TraversalConfig::default();
        let interrupt = AtomicBool::new(false);

        let window = DateWindow::new(Some(d(2025, 1, 1)), Some(d(2025, 1, 31)));
        let req = request(window, Direction::NewestFirst, None, d(2025, 11, 20));
        let t = Traversal::new(&mut host, &mut sink, &cfg, &req, &interrupt);
        assert_eq!(t.initial_offset(), 216);

        let req = request(DateWindow::default(), Direction::NewestFirst, None, d(2025, 11, 20));
        let t = Traversal::new(&mut host, &mut sink, &cfg, &req, &interrupt);
        assert_eq!(t.initial_offset(), 0);
    }
}
