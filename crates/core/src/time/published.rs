use chrono::{DateTime, NaiveDate};

/// Metadata keys that carry a publication date, most specific first.
pub const PUBLISHED_META_KEYS: &[&str] = &[
    "og:article:published_time",
    "article:published_time",
    "sailthru.date",
    "og:article:modified_time",
    "parsely-pub-date",
    "datePublished",
    "publishdate",
    "publish-date",
    "date",
    "last-modified",
    "dc.date",
    "pubdate",
    "article:published",
];

/// Parses the date part out of the formats publishers use in metadata.
pub fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim().trim_end_matches(';').trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }

    let date_part = s.split('T').next().unwrap_or(s).trim_end_matches('Z');
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(d);
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.date_naive());
    }

    for fmt in ["%a, %d %b %Y %H:%M:%S", "%B %d, %Y", "%b %d, %Y", "%Y/%m/%d"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    None
}

/// First parsable date among `PUBLISHED_META_KEYS`, looked up through `get`.
pub fn first_published_date<'a, F>(get: F) -> Option<NaiveDate>
where
    F: Fn(&str) -> Option<&'a str>,
{
    PUBLISHED_META_KEYS
        .iter()
        .filter_map(|k| get(*k))
        .find_map(parse_published_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn d(y: i32, m: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, day)
    }

    #[test]
    fn parses_common_publisher_formats() {
        assert_eq!(parse_published_date("2025-01-10T08:30:00Z"), d(2025, 1, 10));
        assert_eq!(parse_published_date("2025-01-10T08:30:00.000-05:00"), d(2025, 1, 10));
        assert_eq!(parse_published_date("2025-01-10;"), d(2025, 1, 10));
        assert_eq!(parse_published_date("Fri, 10 Jan 2025 08:30:00 +0000"), d(2025, 1, 10));
        assert_eq!(parse_published_date("January 10, 2025"), d(2025, 1, 10));
        assert_eq!(parse_published_date("not a date"), None);
        assert_eq!(parse_published_date(""), None);
    }

    #[test]
    fn metadata_priority_skips_unparsable_values() {
        let mut meta = HashMap::new();
        meta.insert("og:article:published_time", "garbage");
        meta.insert("datePublished", "2025-02-03");
        meta.insert("date", "2024-12-31");
        let got = first_published_date(|k| meta.get(k).copied());
        assert_eq!(got, d(2025, 2, 3));
    }
}
