use std::collections::HashSet;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::db::{class_row, ClassRow, CLASS_ROW_COLUMNS};

/// Title substrings each template type requires.
const KEYWORDS: &[(&str, &[&str])] = &[
    ("Power Zone Endurance", &["Power Zone Endurance"]),
    ("Power Zone Max", &["Power Zone Max"]),
    ("Power Zone", &["Power Zone"]),
    ("FTP Test", &["FTP Test", "Test"]),
    ("FTP Warm Up", &["FTP Warm"]),
    ("Low Impact", &["Low Impact"]),
    ("Ride", &["Ride"]),
];

/// Plain "Power Zone" means neither the endurance nor the max variant.
const PURE_POWER_ZONE_EXCLUDES: &[&str] = &["Endurance", "Max"];

/// One template slot to fill from the cache.
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub template_type: String,
    pub class_type: Option<String>,
    /// Zero means any duration.
    pub duration: u32,
    pub intensity_min: f64,
    /// Zero means any rating.
    pub intensity_max: f64,
    pub instructors: Vec<String>,
    pub allow_fallback: bool,
    /// Tried first, alone and with wide duration and rating windows.
    pub prefer_instructor: Option<String>,
    /// Instructors that must not be picked at any layer.
    pub capped_instructors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Filter {
    duration: Option<(u32, u32)>,
    rating: Option<(f64, f64)>,
    restrict_instructors: bool,
    force_preferred: bool,
    loose_title: bool,
}

impl MatchQuery {
    fn keywords(&self) -> &'static [&'static str] {
        KEYWORDS
            .iter()
            .find(|(t, _)| *t == self.template_type.trim())
            .map(|(_, kws)| *kws)
            .unwrap_or(&[])
    }

    fn exact_duration(&self) -> Option<(u32, u32)> {
        (self.duration > 0).then_some((self.duration, self.duration))
    }

    fn widened_duration(&self, by: u32) -> Option<(u32, u32)> {
        (self.duration > 0).then(|| (self.duration.saturating_sub(by).max(1), self.duration + by))
    }

    fn rating_window(&self) -> Option<(f64, f64)> {
        (self.intensity_max > 0.0).then_some((self.intensity_min, self.intensity_max))
    }

    fn widened_rating(&self, by: f64) -> Option<(f64, f64)> {
        self.rating_window()
            .map(|(low, high)| ((low - by).max(0.0), (high + by).min(10.0)))
    }

    /// Filters from strictest to loosest.
    fn layers(&self) -> Vec<(&'static str, Filter)> {
        let rating = self.rating_window();
        let mut layers = Vec::new();
        if self.prefer_instructor.is_some() {
            layers.push((
                "preferred instructor",
                Filter {
                    duration: self.widened_duration(15),
                    rating: self.widened_rating(2.0),
                    force_preferred: true,
                    loose_title: true,
                    ..Default::default()
                },
            ));
        }
        layers.extend([
            (
                "strict",
                Filter {
                    duration: self.exact_duration(),
                    rating,
                    restrict_instructors: true,
                    ..Default::default()
                },
            ),
            (
                "any instructor",
                Filter { duration: self.exact_duration(), rating, ..Default::default() },
            ),
        ]);
        if self.duration > 0 {
            layers.push((
                "duration ±10",
                Filter { duration: self.widened_duration(10), rating, ..Default::default() },
            ));
        }
        if self.allow_fallback && rating.is_some() {
            for (name, widen) in [("rating ±2", 2.0), ("rating ±3", 3.0)] {
                layers.push((
                    name,
                    Filter {
                        duration: self.exact_duration(),
                        rating: self.widened_rating(widen),
                        ..Default::default()
                    },
                ));
            }
        }
        layers.push(("any rating", Filter { duration: self.exact_duration(), ..Default::default() }));
        layers.push((
            "loose title",
            Filter { duration: self.widened_duration(15), loose_title: true, ..Default::default() },
        ));
        layers
    }
}

/// Pick one random cached class for `q`, relaxing constraints layer by layer.
/// Returns the class and the name of the layer that matched.
pub fn find_candidate(
    conn: &Connection,
    q: &MatchQuery,
    exclude: &HashSet<String>,
) -> Result<Option<(ClassRow, &'static str)>> {
    for (name, filter) in q.layers() {
        if let Some(row) = run_query(conn, q, &filter, exclude)? {
            debug!("Matched {} via {} layer", row.id, name);
            return Ok(Some((row, name)));
        }
    }
    Ok(None)
}

/// Draw up to `count` distinct classes for the same slot.
pub fn find_candidates(conn: &Connection, q: &MatchQuery, count: usize) -> Result<Vec<(ClassRow, &'static str)>> {
    let mut used = HashSet::new();
    let mut picks = Vec::new();
    while picks.len() < count {
        let Some((row, layer)) = find_candidate(conn, q, &used)? else {
            break;
        };
        used.insert(row.id.clone());
        picks.push((row, layer));
    }
    Ok(picks)
}

fn run_query(
    conn: &Connection,
    q: &MatchQuery,
    f: &Filter,
    exclude: &HashSet<String>,
) -> Result<Option<ClassRow>> {
    let mut conditions = vec!["difficulty_rating IS NOT NULL".to_string()];
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ct) = &q.class_type {
        conditions.push(format!("class_type = ?{}", params.len() + 1));
        params.push(Box::new(ct.clone()));
    }
    if let Some((low, high)) = f.duration {
        conditions.push(format!(
            "duration_minutes BETWEEN ?{} AND ?{}",
            params.len() + 1,
            params.len() + 2
        ));
        params.push(Box::new(low));
        params.push(Box::new(high));
    }
    if let Some((low, high)) = f.rating {
        conditions.push(format!(
            "difficulty_rating BETWEEN ?{} AND ?{}",
            params.len() + 1,
            params.len() + 2
        ));
        params.push(Box::new(low));
        params.push(Box::new(high));
    }
    if let (true, Some(name)) = (f.force_preferred, &q.prefer_instructor) {
        params.push(Box::new(name.clone()));
        conditions.push(format!("instructor = ?{}", params.len()));
    }
    if f.restrict_instructors && !q.instructors.is_empty() {
        let mut slots = Vec::new();
        for name in &q.instructors {
            params.push(Box::new(name.clone()));
            slots.push(format!("?{}", params.len()));
        }
        conditions.push(format!("instructor IN ({})", slots.join(",")));
    }
    if !f.loose_title {
        for kw in q.keywords() {
            params.push(Box::new(format!("%{}%", kw)));
            conditions.push(format!("title LIKE ?{}", params.len()));
        }
        if q.template_type.trim() == "Power Zone" {
            for ex in PURE_POWER_ZONE_EXCLUDES {
                params.push(Box::new(format!("%{}%", ex)));
                conditions.push(format!("title NOT LIKE ?{}", params.len()));
            }
        }
    }
    if !q.capped_instructors.is_empty() {
        let mut slots = Vec::new();
        for name in &q.capped_instructors {
            params.push(Box::new(name.clone()));
            slots.push(format!("?{}", params.len()));
        }
        conditions.push(format!("instructor NOT IN ({})", slots.join(",")));
    }
    exclude_ids(exclude, &mut conditions, &mut params);

    let sql = format!(
        "SELECT {} FROM classes WHERE {} ORDER BY RANDOM() LIMIT 1",
        CLASS_ROW_COLUMNS,
        conditions.join(" AND ")
    );
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    Ok(conn.query_row(&sql, param_refs.as_slice(), class_row).optional()?)
}

fn exclude_ids(
    exclude: &HashSet<String>,
    conditions: &mut Vec<String>,
    params: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
) {
    if exclude.is_empty() {
        return;
    }
    let mut slots = Vec::new();
    for id in exclude {
        params.push(Box::new(id.clone()));
        slots.push(format!("?{}", params.len()));
    }
    conditions.push(format!("id NOT IN ({})", slots.join(",")));
}

/// Warm-up taught by the same instructor as `test`, aired the same day, or
/// failing that the closest one within a day either side.
pub fn find_matched_warmup(
    conn: &Connection,
    test: &ClassRow,
    exclude: &HashSet<String>,
) -> Result<Option<ClassRow>> {
    if test.instructor.is_empty() || test.original_air_time.is_empty() {
        return Ok(None);
    }
    let attempts = [
        (
            "original_air_time = ?2",
            "duration_minutes ASC",
        ),
        (
            "original_air_time BETWEEN date(?2, '-1 day') AND date(?2, '+1 day')",
            "ABS(julianday(original_air_time) - julianday(?2)) ASC, duration_minutes ASC",
        ),
    ];
    for (day_filter, order) in attempts {
        let mut conditions = vec![
            "instructor = ?1".to_string(),
            day_filter.to_string(),
            "(title LIKE '%FTP Warm%' OR title LIKE '%Warm Up%')".to_string(),
        ];
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(test.instructor.clone()),
            Box::new(test.original_air_time.clone()),
        ];
        let mut skip = exclude.clone();
        skip.insert(test.id.clone());
        exclude_ids(&skip, &mut conditions, &mut params);

        let sql = format!(
            "SELECT {} FROM classes WHERE {} ORDER BY {} LIMIT 1",
            CLASS_ROW_COLUMNS,
            conditions.join(" AND "),
            order
        );
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        if let Some(row) = conn.query_row(&sql, param_refs.as_slice(), class_row).optional()? {
            return Ok(Some(row));
        }
    }
    Ok(None)
}
