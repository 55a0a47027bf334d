use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Statement};
use serde::Serialize;
use tracing::info;

use crate::catalog::{ClassRecord, RecordSink};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS classes (
            id                TEXT PRIMARY KEY,
            title             TEXT,
            instructor        TEXT,
            duration_minutes  INTEGER,
            difficulty_rating REAL,
            class_type        TEXT,
            original_air_time TEXT,
            url               TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_classes_match
            ON classes(class_type, duration_minutes, difficulty_rating);
        ",
    )?;
    Ok(())
}

// ── Writing ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Per-record writer with statements prepared once for the whole run.
pub struct ClassWriter<'c> {
    exists: Statement<'c>,
    upsert: Statement<'c>,
}

impl<'c> ClassWriter<'c> {
    pub fn new(conn: &'c Connection) -> Result<Self> {
        Ok(Self {
            exists: conn.prepare("SELECT 1 FROM classes WHERE id = ?1")?,
            upsert: conn.prepare(
                "INSERT OR REPLACE INTO classes
                 (id, title, instructor, duration_minutes, difficulty_rating,
                  class_type, original_air_time, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?,
        })
    }

    /// Last write wins; an id never produces a second row.
    pub fn upsert(&mut self, c: &ClassRecord) -> Result<Upsert> {
        let existed = self
            .exists
            .query_row([&c.id], |_| Ok(()))
            .optional()?
            .is_some();
        let air_time = c
            .original_air_time
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        self.upsert.execute(rusqlite::params![
            c.id,
            c.title,
            c.instructor,
            c.duration_minutes,
            c.difficulty_rating,
            c.class_type,
            air_time,
            c.url,
        ])?;
        Ok(if existed { Upsert::Updated } else { Upsert::Inserted })
    }
}

impl RecordSink for ClassWriter<'_> {
    fn persist(&mut self, record: &ClassRecord) -> Result<()> {
        let action = self.upsert(record)?;
        info!(
            "[{}] {} | {} | {} min | rating {}",
            match action {
                Upsert::Inserted => "INSERTED",
                Upsert::Updated => "UPDATED",
            },
            record.title,
            record.instructor,
            record.duration_minutes.map_or("?".into(), |m| m.to_string()),
            record.difficulty_rating.map_or("?".into(), |r| r.to_string()),
        );
        Ok(())
    }
}

// ── Reading ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRow {
    pub id: String,
    pub title: String,
    pub instructor: String,
    pub duration_minutes: Option<u32>,
    pub difficulty_rating: Option<f64>,
    pub original_air_time: String,
    pub url: String,
}

pub const CLASS_ROW_COLUMNS: &str = "id, COALESCE(title,''), COALESCE(instructor,''), \
     duration_minutes, difficulty_rating, COALESCE(original_air_time,''), COALESCE(url,'')";

pub fn class_row(row: &rusqlite::Row) -> rusqlite::Result<ClassRow> {
    Ok(ClassRow {
        id: row.get(0)?,
        title: row.get(1)?,
        instructor: row.get(2)?,
        duration_minutes: row.get(3)?,
        difficulty_rating: row.get(4)?,
        original_air_time: row.get(5)?,
        url: row.get(6)?,
    })
}

pub fn fetch_class(conn: &Connection, id: &str) -> Result<Option<ClassRow>> {
    let sql = format!("SELECT {} FROM classes WHERE id = ?1", CLASS_ROW_COLUMNS);
    Ok(conn.query_row(&sql, [id], class_row).optional()?)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub rated: usize,
    pub with_duration: usize,
    pub earliest: Option<String>,
    pub latest: Option<String>,
    pub by_type: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let total: usize = conn.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?;
    let rated: usize = conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE difficulty_rating IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let with_duration: usize = conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE duration_minutes IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let (earliest, latest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(original_air_time), MAX(original_air_time)
         FROM classes WHERE original_air_time != ''",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let mut stmt = conn.prepare(
        "SELECT COALESCE(class_type,''), COUNT(*) FROM classes
         GROUP BY class_type ORDER BY COUNT(*) DESC",
    )?;
    let by_type = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stats {
        total,
        rated,
        with_duration,
        earliest,
        latest,
        by_type,
    })
}
