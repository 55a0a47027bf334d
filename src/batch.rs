use anyhow::{Context, Result};
use chrono::{Datelike, Months, NaiveDate};
use tracing::{error, info};

use crate::catalog::driver::{RunSummary, StopReason};

/// Parse "YYYY-MM" into the first day of that month.
pub fn parse_month(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", s.trim()), "%Y-%m-%d")
        .with_context(|| format!("Invalid month {:?}, expected YYYY-MM", s))
}

/// Inclusive (first day, last day) pairs for every month from `from` to `to`.
pub fn month_ranges(from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    let Some(mut cur) = from.with_day(1) else {
        return ranges;
    };
    while cur <= to {
        let Some(next) = cur.checked_add_months(Months::new(1)) else {
            break;
        };
        let last = next.pred_opt().unwrap_or(cur);
        ranges.push((cur, last));
        cur = next;
    }
    ranges
}

pub struct MonthFailure {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub reason: String,
}

impl MonthFailure {
    /// `command` carries the global options (store, config) the batch ran with.
    pub fn rerun_command(&self, command: &str) -> String {
        format!("{} scrape --start-date {} --end-date {}", command, self.start, self.end)
    }
}

#[derive(Default)]
pub struct BatchReport {
    pub months: usize,
    pub extracted: usize,
    pub failed: Vec<MonthFailure>,
    pub interrupted: bool,
}

impl BatchReport {
    pub fn print(&self, command: &str) {
        println!(
            "Batch finished: {} months, {} classes extracted, {} months failed.",
            self.months,
            self.extracted,
            self.failed.len()
        );
        if self.interrupted {
            println!("Stopped early: interrupted.");
        }
        if !self.failed.is_empty() {
            println!("\nFailed months (re-run individually):");
            for f in &self.failed {
                println!("  {} to {}: {}", f.start, f.end, f.reason);
                println!("    {}", f.rerun_command(command));
            }
        }
    }
}

/// Run `scrape_month` over each range in turn. A failing month is recorded
/// and the batch moves on; an interrupted month ends the batch.
pub fn run_months<F>(ranges: &[(NaiveDate, NaiveDate)], mut scrape_month: F) -> BatchReport
where
    F: FnMut(NaiveDate, NaiveDate) -> Result<RunSummary>,
{
    let mut report = BatchReport::default();
    for (i, &(start, end)) in ranges.iter().enumerate() {
        info!("Month {}/{}: {} to {}", i + 1, ranges.len(), start, end);
        report.months += 1;
        match scrape_month(start, end) {
            Ok(summary) => {
                report.extracted += summary.extracted;
                match summary.stop {
                    StopReason::Interrupted => {
                        report.interrupted = true;
                        break;
                    }
                    StopReason::Aborted(e) => {
                        error!("Month {} aborted: {}", start.format("%Y-%m"), e);
                        report.failed.push(MonthFailure { start, end, reason: e.to_string() });
                    }
                    _ => {}
                }
            }
            Err(e) => {
                error!("Month {} failed: {:#}", start.format("%Y-%m"), e);
                report.failed.push(MonthFailure { start, end, reason: format!("{:#}", e) });
            }
        }
    }
    report
}
