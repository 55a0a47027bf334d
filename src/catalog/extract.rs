use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,3})\s*min").unwrap());
static RATING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,2}\.\d+$").unwrap());

const INSTRUCTOR_SEPARATOR: char = '·';

/// Raw text captured from an open detail view. Owned, so it survives the
/// page re-rendering underneath.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DetailSnapshot {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    /// Short visible text fragments (badges, pills, stats) in page order.
    #[serde(default)]
    pub fragments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub title: String,
    pub instructor: String,
    pub duration_minutes: Option<u32>,
    pub difficulty_rating: Option<f64>,
}

/// Each field falls back on its own; a missing field never fails the rest.
pub fn extract_fields(detail: &DetailSnapshot, tile_title: &str) -> ExtractedFields {
    let title = non_empty(detail.title.as_deref())
        .unwrap_or_else(|| tile_title.trim())
        .to_string();

    let duration_minutes = duration_from_badges(&detail.fragments).or_else(|| duration_from_title(&title));

    ExtractedFields {
        instructor: instructor_from_subtitle(detail.subtitle.as_deref()),
        duration_minutes,
        difficulty_rating: rating_from_fragments(&detail.fragments),
        title,
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// "JOHN DOE · Cycling · 12/01/24" → "JOHN DOE". Legacy subtitles have no
/// separator and are the name alone.
pub fn instructor_from_subtitle(subtitle: Option<&str>) -> String {
    match non_empty(subtitle) {
        Some(sub) => sub
            .split(INSTRUCTOR_SEPARATOR)
            .next()
            .unwrap_or(sub)
            .trim()
            .to_string(),
        None => String::new(),
    }
}

pub fn duration_from_badges(fragments: &[String]) -> Option<u32> {
    fragments.iter().find_map(|f| {
        let caps = DURATION_RE.captures(f)?;
        caps[1].parse::<u32>().ok().filter(|m| *m > 0)
    })
}

/// "45 min Power Zone Ride" → 45.
pub fn duration_from_title(title: &str) -> Option<u32> {
    title
        .split_whitespace()
        .next()?
        .parse::<u32>()
        .ok()
        .filter(|m| *m > 0)
}

/// First fragment that reads as a 0-10 decimal. Badges like "120+" are never
/// ratings.
pub fn rating_from_fragments(fragments: &[String]) -> Option<f64> {
    fragments.iter().find_map(|f| {
        let t = f.trim();
        if t.contains('+') || !RATING_RE.is_match(t) {
            return None;
        }
        t.parse::<f64>().ok().filter(|v| (0.0..=10.0).contains(v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(title: Option<&str>, subtitle: Option<&str>, fragments: &[&str]) -> DetailSnapshot {
        DetailSnapshot {
            title: title.map(String::from),
            subtitle: subtitle.map(String::from),
            fragments: frags(fragments),
        }
    }

    #[test]
    fn full_detail_view() {
        let d = snapshot(
            Some("45 min Power Zone Endurance Ride"),
            Some("DENIS MORTON · Cycling · 3/4/25"),
            &["45 min", "120+", "7.92", "Intermediate"],
        );
        let f = extract_fields(&d, "tile title");
        assert_eq!(f.title, "45 min Power Zone Endurance Ride");
        assert_eq!(f.instructor, "DENIS MORTON");
        assert_eq!(f.duration_minutes, Some(45));
        assert_eq!(f.difficulty_rating, Some(7.92));
    }

    #[test]
    fn rating_skips_plus_badges() {
        let r = rating_from_fragments(&frags(&["120+", "8.5"]));
        assert_eq!(r, Some(8.5));
        assert_eq!(rating_from_fragments(&frags(&["1.5+", "6.0"])), Some(6.0));
    }

    #[test]
    fn rating_unknown_not_zero() {
        assert_eq!(rating_from_fragments(&frags(&["120+", "45 min", "Beginner", "11.2", "8"])), None);
        assert_eq!(rating_from_fragments(&[]), None);
    }

    #[test]
    fn rating_bounds_inclusive() {
        assert_eq!(rating_from_fragments(&frags(&["10.0"])), Some(10.0));
        assert_eq!(rating_from_fragments(&frags(&["0.0"])), Some(0.0));
        assert_eq!(rating_from_fragments(&frags(&["10.01"])), None);
    }

    #[test]
    fn title_falls_back_to_tile() {
        let d = snapshot(None, None, &[]);
        assert_eq!(extract_fields(&d, " 30 min Power Zone Ride ").title, "30 min Power Zone Ride");
        let d = snapshot(Some("   "), None, &[]);
        assert_eq!(extract_fields(&d, "20 min FTP Warm Up Ride").title, "20 min FTP Warm Up Ride");
    }

    #[test]
    fn instructor_variants() {
        assert_eq!(instructor_from_subtitle(Some("MATT WILPERS · Cycling")), "MATT WILPERS");
        assert_eq!(instructor_from_subtitle(Some("  OLIVIA AMATO  ")), "OLIVIA AMATO");
        assert_eq!(instructor_from_subtitle(None), "");
        assert_eq!(instructor_from_subtitle(Some("")), "");
    }

    #[test]
    fn duration_prefers_badge() {
        let d = snapshot(Some("60 min Power Zone Ride"), None, &["Music", "45 min"]);
        assert_eq!(extract_fields(&d, "").duration_minutes, Some(45));
    }

    #[test]
    fn duration_from_title_when_no_badge() {
        let d = snapshot(Some("75 min Power Zone Endurance Ride"), None, &["Explicit"]);
        assert_eq!(extract_fields(&d, "").duration_minutes, Some(75));
    }

    #[test]
    fn duration_unknown_not_zero() {
        let d = snapshot(Some("Power Zone Ride"), None, &["Climb", "0 min"]);
        assert_eq!(extract_fields(&d, "").duration_minutes, None);
        assert_eq!(duration_from_title("0 min Ride"), None);
    }

    #[test]
    fn empty_detail_keeps_tile_title_only() {
        let f = extract_fields(&DetailSnapshot::default(), "Power Zone Ride");
        assert_eq!(
            f,
            ExtractedFields {
                title: "Power Zone Ride".into(),
                instructor: String::new(),
                duration_minutes: None,
                difficulty_rating: None,
            }
        );
    }
}
