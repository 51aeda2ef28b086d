//! Output formatting for the cache inspection commands

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use gamenight_core::cache::DurableEntryInfo;
use serde_json::{json, Value};

/// State of one durable entry as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Valid,
    Expired,
    Corrupt,
}

impl EntryStatus {
    pub fn of(info: &DurableEntryInfo) -> Self {
        match (&info.envelope, info.valid) {
            (None, _) => EntryStatus::Corrupt,
            (Some(_), true) => EntryStatus::Valid,
            (Some(_), false) => EntryStatus::Expired,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Valid => "valid",
            EntryStatus::Expired => "expired",
            EntryStatus::Corrupt => "corrupt",
        }
    }

    fn color(self) -> Color {
        match self {
            EntryStatus::Valid => Color::Green,
            EntryStatus::Expired => Color::Yellow,
            EntryStatus::Corrupt => Color::Red,
        }
    }
}

/// Valid / expired / corrupt tallies
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub valid: usize,
    pub expired: usize,
    pub corrupt: usize,
}

pub fn count_statuses(entries: &[DurableEntryInfo]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for info in entries {
        match EntryStatus::of(info) {
            EntryStatus::Valid => counts.valid += 1,
            EntryStatus::Expired => counts.expired += 1,
            EntryStatus::Corrupt => counts.corrupt += 1,
        }
    }
    counts
}

/// Table (or JSON array) of durable entries
pub fn format_entries(entries: &[DurableEntryInfo], json: bool, no_color: bool) -> String {
    if json {
        let rows: Vec<Value> = entries
            .iter()
            .map(|info| {
                json!({
                    "key": info.key,
                    "sizeBytes": info.size_bytes,
                    "status": EntryStatus::of(info).as_str(),
                    "timestamp": info.envelope.as_ref().map(|e| e.written_at),
                    "expiresAt": info.envelope.as_ref().map(|e| e.expires_at),
                })
            })
            .collect();
        return serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string());
    }

    if entries.is_empty() {
        return "No cached entries.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let headers = ["Key", "Size", "Written", "Expires", "Status"];
    if no_color {
        table.set_header(headers.to_vec());
    } else {
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }

    for info in entries {
        let status = EntryStatus::of(info);
        let (written, expires) = match info.envelope {
            Some(ref e) => (format_timestamp(e.written_at), format_timestamp(e.expires_at)),
            None => ("-".to_string(), "-".to_string()),
        };
        let status_cell = if no_color {
            Cell::new(status.as_str())
        } else {
            Cell::new(status.as_str()).fg(status.color())
        };

        table.add_row(Row::from(vec![
            Cell::new(truncate(&info.key, 48)),
            Cell::new(format_size(info.size_bytes as u64)),
            Cell::new(written),
            Cell::new(expires),
            status_cell,
        ]));
    }

    table.to_string()
}

pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        s.to_string()
    } else {
        s.chars().take(max - 1).collect::<String>() + "…"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamenight_core::cache::CacheEntry;

    fn info(key: &str, envelope: Option<CacheEntry<Value>>, valid: bool) -> DurableEntryInfo {
        DurableEntryInfo {
            key: key.to_string(),
            size_bytes: 64,
            envelope,
            valid,
        }
    }

    fn entry() -> CacheEntry<Value> {
        CacheEntry {
            data: json!({"friends": 5}),
            written_at: 1_700_000_000_000,
            expires_at: 1_700_000_300_000,
        }
    }

    #[test]
    fn test_status_classification() {
        let entries = vec![
            info("profile_stats_u1", Some(entry()), true),
            info("profile_stats_u2", Some(entry()), false),
            info("garbage", None, false),
        ];
        assert_eq!(
            count_statuses(&entries),
            StatusCounts {
                valid: 1,
                expired: 1,
                corrupt: 1
            }
        );
    }

    #[test]
    fn test_format_entries_json() {
        let out = format_entries(&[info("profile_stats_u1", Some(entry()), true)], true, true);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["key"], "profile_stats_u1");
        assert_eq!(parsed[0]["status"], "valid");
        assert_eq!(parsed[0]["expiresAt"], 1_700_000_300_000i64);
    }

    #[test]
    fn test_format_entries_empty_table() {
        assert_eq!(format_entries(&[], false, true), "No cached entries.");
    }

    #[test]
    fn test_format_timestamp_and_size() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("événement_long", 5), "évén…");
        assert_eq!(truncate("short", 10), "short");
    }
}
