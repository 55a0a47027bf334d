use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{ensure, Context, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PlanConfig;
use crate::db::ClassRow;
use crate::matching::{find_candidate, find_matched_warmup, MatchQuery};

const NO_MATCH: &str = "NO MATCH";
const FTP_TEST: &str = "FTP Test";
const WARMUP_TYPE: &str = "FTP Warm Up";
const WARMUP_NOTE: &str = "Matched warm-up";

/// One template line as written in the CSV. Numeric cells may be blank.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateRow {
    #[serde(rename = "Week")]
    pub week: String,
    #[serde(rename = "Phase", default)]
    pub phase: String,
    #[serde(rename = "Day", default)]
    pub day: String,
    #[serde(rename = "Type")]
    pub template_type: String,
    #[serde(rename = "Duration_Min", default)]
    pub duration: String,
    #[serde(rename = "Intensity_Min", default)]
    pub intensity_min: String,
    #[serde(rename = "Intensity_Max", default)]
    pub intensity_max: String,
    #[serde(rename = "Instructor_Preference", default)]
    pub instructor_preference: String,
    #[serde(rename = "Notes", default)]
    pub notes: String,
}

/// Parsed numbers of a template line.
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    week: u32,
    day: u32,
    duration: u32,
    intensity_min: f64,
    intensity_max: f64,
    instructors: Vec<String>,
}

impl TemplateRow {
    fn slot(&self) -> Result<Slot> {
        let week: u32 = number(&self.week, "Week")?.context("Week is required")?;
        let day: u32 = number(&self.day, "Day")?.unwrap_or(1);
        ensure!(week >= 1 && day >= 1, "Week and Day start at 1");
        Ok(Slot {
            week,
            day,
            duration: number(&self.duration, "Duration_Min")?.unwrap_or(0),
            intensity_min: number(&self.intensity_min, "Intensity_Min")?.unwrap_or(0.0),
            intensity_max: number(&self.intensity_max, "Intensity_Max")?.unwrap_or(0.0),
            instructors: instructor_list(&self.instructor_preference),
        })
    }

    fn is_rest(&self, slot: &Slot) -> bool {
        self.template_type.trim().eq_ignore_ascii_case("rest") || slot.duration == 0
    }
}

fn number<T>(raw: &str, column: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .with_context(|| format!("Invalid {} {:?}", column, raw))
}

fn instructor_list(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_matches('"')
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn read_template(path: &Path) -> Result<Vec<TemplateRow>> {
    let file = File::open(path).with_context(|| format!("Template not found: {}", path.display()))?;
    parse_template(file).with_context(|| format!("Failed to read template {}", path.display()))
}

pub fn parse_template<R: Read>(reader: R) -> Result<Vec<TemplateRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for (i, result) in rdr.deserialize::<TemplateRow>().enumerate() {
        let row = result.with_context(|| format!("Bad template row {}", i + 1))?;
        row.slot().with_context(|| format!("Bad template row {}", i + 1))?;
        rows.push(row);
    }
    ensure!(!rows.is_empty(), "Template has no rows");
    Ok(rows)
}

/// The Monday after `today`; a Monday maps to the following week.
pub fn next_monday(today: NaiveDate) -> NaiveDate {
    let ahead = 7 - today.weekday().num_days_from_monday();
    today + Days::new(ahead as u64)
}

/// Calendar date of `week`/`day`, both counted from 1.
pub fn slot_date(start: NaiveDate, week: u32, day: u32) -> NaiveDate {
    let offset = (week.saturating_sub(1) as u64) * 7 + day.saturating_sub(1) as u64;
    start + Days::new(offset)
}

/// One line of the generated plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    #[serde(rename = "Week")]
    pub week: u32,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Phase")]
    pub phase: String,
    #[serde(rename = "Day")]
    pub day: String,
    #[serde(rename = "Template_Type")]
    pub template_type: String,
    #[serde(rename = "Selected_Class_ID")]
    pub class_id: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Instructor")]
    pub instructor: String,
    #[serde(rename = "Duration")]
    pub duration: Option<u32>,
    #[serde(rename = "Intensity_Min")]
    pub intensity_min: f64,
    #[serde(rename = "Intensity_Max")]
    pub intensity_max: f64,
    #[serde(rename = "Difficulty_Rating")]
    pub difficulty_rating: Option<f64>,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Notes")]
    pub notes: String,
}

pub struct PlanOutcome {
    pub rows: Vec<PlanRow>,
    pub unmatched: usize,
    /// Must-include instructors who never made it into the plan.
    pub missing_instructors: Vec<String>,
}

impl PlanOutcome {
    pub fn print(&self, path: &Path) {
        println!("Plan saved to {}", path.display());
        println!("Total rows: {} | Unmatched: {}", self.rows.len(), self.unmatched);
        if !self.missing_instructors.is_empty() {
            println!("Missing required instructors: {}", self.missing_instructors.join(", "));
        }
        if self.unmatched > 0 {
            println!("Try --fallback or broader intensity ranges in the template.");
        }
    }
}

/// Running state while slots are filled: classes already placed and how many
/// slots each instructor holds.
struct Planner<'a> {
    conn: &'a Connection,
    rules: &'a PlanConfig,
    allow_fallback: bool,
    used: HashSet<String>,
    counts: HashMap<String, usize>,
}

impl<'a> Planner<'a> {
    fn capped(&self) -> Vec<String> {
        self.rules
            .instructor_limits
            .iter()
            .filter(|(name, limit)| self.count(name) >= **limit)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn count(&self, instructor: &str) -> usize {
        self.counts.get(instructor).copied().unwrap_or(0)
    }

    fn under_cap(&self, instructor: &str) -> bool {
        self.rules
            .instructor_limits
            .get(instructor)
            .map_or(true, |limit| self.count(instructor) < *limit)
    }

    fn missing(&self) -> Vec<String> {
        self.rules
            .must_include
            .iter()
            .filter(|name| self.count(name) == 0)
            .cloned()
            .collect()
    }

    fn take(&mut self, class: &ClassRow) {
        self.used.insert(class.id.clone());
        *self.counts.entry(class.instructor.clone()).or_insert(0) += 1;
    }

    fn fill(&self, template_type: &str, slot: &Slot, prefer: Option<String>) -> Result<Option<ClassRow>> {
        let query = MatchQuery {
            template_type: template_type.to_string(),
            class_type: None,
            duration: slot.duration,
            intensity_min: slot.intensity_min,
            intensity_max: slot.intensity_max,
            instructors: slot.instructors.clone(),
            allow_fallback: self.allow_fallback,
            prefer_instructor: prefer,
            capped_instructors: self.capped(),
        };
        Ok(find_candidate(self.conn, &query, &self.used)?.map(|(row, layer)| {
            debug!("{} slot filled by {} ({})", template_type, row.id, layer);
            row
        }))
    }
}

/// Fill every template slot from the cache. A class appears at most once in
/// the plan; an FTP test gets a warm-up by the same instructor placed just
/// before it when one aired within a day.
pub fn build_plan(
    conn: &Connection,
    template: &[TemplateRow],
    start: NaiveDate,
    allow_fallback: bool,
    rules: &PlanConfig,
) -> Result<PlanOutcome> {
    let mut planner = Planner {
        conn,
        rules,
        allow_fallback,
        used: HashSet::new(),
        counts: HashMap::new(),
    };
    let mut rows: Vec<PlanRow> = Vec::new();
    let mut unmatched = 0;

    for t in template {
        let slot = t.slot()?;
        let template_type = t.template_type.trim();
        let base = PlanRow {
            week: slot.week,
            date: slot_date(start, slot.week, slot.day),
            phase: t.phase.clone(),
            day: t.day.clone(),
            template_type: template_type.to_string(),
            class_id: String::new(),
            title: String::new(),
            instructor: String::new(),
            duration: None,
            intensity_min: slot.intensity_min,
            intensity_max: slot.intensity_max,
            difficulty_rating: None,
            url: String::new(),
            notes: t.notes.clone(),
        };

        if t.is_rest(&slot) {
            rows.push(base);
            continue;
        }

        // Near the end of the plan, spend slots on required instructors still absent.
        let prefer = if rows.len() + rules.must_include_tail > template.len() {
            planner.missing().into_iter().next()
        } else {
            None
        };

        let Some(class) = planner.fill(template_type, &slot, prefer)? else {
            warn!("No match for week {} day {} ({})", slot.week, t.day, template_type);
            unmatched += 1;
            rows.push(PlanRow {
                title: NO_MATCH.to_string(),
                duration: Some(slot.duration),
                ..base
            });
            continue;
        };
        planner.take(&class);

        if template_type == FTP_TEST {
            if let Some(warm) = find_matched_warmup(conn, &class, &planner.used)? {
                if planner.under_cap(&warm.instructor) {
                    planner.take(&warm);
                    rows.push(PlanRow {
                        template_type: WARMUP_TYPE.to_string(),
                        notes: WARMUP_NOTE.to_string(),
                        ..with_class(&base, &warm)
                    });
                }
            }
        }
        rows.push(with_class(&base, &class));
    }

    let missing_instructors = planner.missing();
    info!("Plan built: {} rows, {} unmatched", rows.len(), unmatched);
    Ok(PlanOutcome { rows, unmatched, missing_instructors })
}

fn with_class(base: &PlanRow, class: &ClassRow) -> PlanRow {
    PlanRow {
        class_id: class.id.clone(),
        title: class.title.clone(),
        instructor: class.instructor.clone(),
        duration: class.duration_minutes,
        difficulty_rating: class.difficulty_rating,
        url: class.url.clone(),
        ..base.clone()
    }
}

pub fn write_plan<W: Write>(out: W, rows: &[PlanRow]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// `<dir>/<template name without "template">-YYYYMMDD-HHMM.csv`
pub fn output_path(template: &Path, dir: &Path, now: NaiveDateTime) -> PathBuf {
    let stem = template
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned = stem.replace("template", "").replace("Template", "");
    let cleaned = cleaned.trim_matches(|c: char| c == '-' || c == '_' || c == ' ');
    let name = if cleaned.is_empty() { "plan" } else { cleaned };
    dir.join(format!("{}-{}.csv", name, now.format("%Y%m%d-%H%M")))
}
