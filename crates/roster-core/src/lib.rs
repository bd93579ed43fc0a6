//! Core schedule model, row hashing and run records for roster sync.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-core";

/// Key of the singleton settings row.
pub const SETTINGS_ID: i32 = 1;

/// Target column names of the hashed (non-key) fields, in hash order.
///
/// Reordering this list changes every stored comparison: the first sync after
/// such a change reports every row as updated.
pub const HASHED_FIELDS: [&str; 15] = [
    "employee_name",
    "gender",
    "division",
    "department",
    "section",
    "supervisor_id",
    "supervisor_name",
    "position_title",
    "grade_interval",
    "phone",
    "day_type",
    "description",
    "time_in",
    "time_out",
    "next_day",
];

/// Row as returned by the upstream query or read back from the target table.
///
/// Every column arrives as optional text; nothing is normalized yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawScheduleRow {
    pub employee_id: String,
    pub employee_name: Option<String>,
    pub gender: Option<String>,
    pub division: Option<String>,
    pub department: Option<String>,
    pub section: Option<String>,
    pub supervisor_id: Option<String>,
    pub supervisor_name: Option<String>,
    pub position_title: Option<String>,
    pub grade_interval: Option<String>,
    pub phone: Option<String>,
    pub day_type: Option<String>,
    pub description: Option<String>,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
    pub next_day: Option<String>,
}

/// Normalized employee schedule, keyed by `employee_id`.
///
/// All fields hold their string form; `next_day` is always `"1"` or `"0"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub employee_id: String,
    pub employee_name: String,
    pub gender: String,
    pub division: String,
    pub department: String,
    pub section: String,
    pub supervisor_id: String,
    pub supervisor_name: String,
    pub position_title: String,
    pub grade_interval: String,
    pub phone: String,
    pub day_type: String,
    pub description: String,
    pub time_in: String,
    pub time_out: String,
    pub next_day: String,
}

/// Returns true for the overnight tokens `y`, `yes`, `true` and `1`, any case.
pub fn is_next_day(token: &str) -> bool {
    matches!(
        token.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true" | "1"
    )
}

/// Storage form of a boolean-ish `next_day` value.
pub fn next_day_flag(token: Option<&str>) -> &'static str {
    if token.is_some_and(is_next_day) {
        "1"
    } else {
        "0"
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

impl ScheduleRecord {
    pub fn from_raw(raw: &RawScheduleRow) -> Self {
        Self {
            employee_id: raw.employee_id.clone(),
            employee_name: text(&raw.employee_name),
            gender: text(&raw.gender),
            division: text(&raw.division),
            department: text(&raw.department),
            section: text(&raw.section),
            supervisor_id: text(&raw.supervisor_id),
            supervisor_name: text(&raw.supervisor_name),
            position_title: text(&raw.position_title),
            grade_interval: text(&raw.grade_interval),
            phone: text(&raw.phone),
            day_type: text(&raw.day_type),
            description: text(&raw.description),
            time_in: text(&raw.time_in),
            time_out: text(&raw.time_out),
            next_day: next_day_flag(raw.next_day.as_deref()).to_string(),
        }
    }

    /// Cuts `phone` to at most `max_len` characters. A cap of 0 means unbounded.
    pub fn truncate_phone(&mut self, max_len: usize) {
        if max_len > 0 && self.phone.chars().count() > max_len {
            self.phone = self.phone.chars().take(max_len).collect();
        }
    }

    pub fn is_next_day(&self) -> bool {
        is_next_day(&self.next_day)
    }

    /// Hashed field values, aligned with [`HASHED_FIELDS`].
    pub fn hashed_values(&self) -> [&str; 15] {
        [
            &self.employee_name,
            &self.gender,
            &self.division,
            &self.department,
            &self.section,
            &self.supervisor_id,
            &self.supervisor_name,
            &self.position_title,
            &self.grade_interval,
            &self.phone,
            &self.day_type,
            &self.description,
            &self.time_in,
            &self.time_out,
            &self.next_day,
        ]
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_fields(&self.hashed_values())
    }

    /// One-line run summary: `id | name | day type | in-out | next day`.
    pub fn detail_line(&self) -> String {
        format!(
            "{} | {} | {} | {}-{} | {}",
            self.employee_id,
            self.employee_name,
            self.day_type,
            self.time_in,
            self.time_out,
            self.next_day
        )
    }

    /// Field-by-field differences from `self` (stored) to `newer` (upstream).
    pub fn diff(&self, newer: &ScheduleRecord) -> Vec<FieldChange> {
        HASHED_FIELDS
            .iter()
            .zip(self.hashed_values().iter().zip(newer.hashed_values()))
            .filter(|(_, (old, new))| **old != *new)
            .map(|(field, (old, new))| FieldChange {
                employee_id: newer.employee_id.clone(),
                field: (*field).to_string(),
                old_value: (*old).to_string(),
                new_value: new.to_string(),
            })
            .collect()
    }
}

/// SHA-256 hex digest over the pipe-joined hashed fields of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_fields(values: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(values.join("|").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One changed column of one employee, recorded for the audit view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub employee_id: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Result of one engine execution. Immutable once appended to the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub updated: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub details_updated: Vec<String>,
    pub details_inserted: Vec<String>,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncRun {
    /// Record for a run that aborted before committing anything.
    pub fn failed(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp,
            total: 0,
            updated: 0,
            inserted: 0,
            unchanged: 0,
            details_updated: Vec::new(),
            details_inserted: Vec::new(),
            changes: Vec::new(),
            success: false,
            error: Some(message.into()),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.updated + self.inserted > 0
    }
}

/// A run as persisted in the log, with its monotonic log id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub run: SyncRun,
}

/// Persisted scheduler settings (singleton row [`SETTINGS_ID`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Run log page request. Rows are always ordered newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    pub page: u32,
    pub page_size: u32,
    /// Keyset cursor: only rows with `id < before_id`.
    pub before_id: Option<i64>,
    pub only_with_changes: bool,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            before_id: None,
            only_with_changes: false,
        }
    }
}

impl LogQuery {
    /// Clamps page and size. A keyset cursor replaces offset paging, so it
    /// always reads the first page after the cursor.
    pub fn normalized(self) -> Self {
        let page = if self.before_id.is_some() { 1 } else { self.page.max(1) };
        Self {
            page,
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
            ..self
        }
    }

    pub fn offset(&self) -> u64 {
        if self.before_id.is_some() {
            return 0;
        }
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub logs: Vec<SyncLogEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
    pub next_cursor: Option<i64>,
}

impl LogPage {
    pub fn new(logs: Vec<SyncLogEntry>, query: LogQuery, total: u64) -> Self {
        let query = query.normalized();
        let page_size = u64::from(query.page_size);
        let total_pages = total.div_ceil(page_size).max(1);
        let next_cursor = if logs.len() as u64 == page_size {
            logs.last().map(|entry| entry.id)
        } else {
            None
        };
        Self {
            logs,
            page: query.page,
            page_size: query.page_size,
            total,
            total_pages,
            next_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawScheduleRow {
        RawScheduleRow {
            employee_id: "E1".into(),
            employee_name: Some("Jane Doe".into()),
            gender: Some("F".into()),
            division: Some("Ops".into()),
            department: Some("Mining".into()),
            section: Some("Shift A".into()),
            supervisor_id: Some("S01".into()),
            supervisor_name: Some("Bob".into()),
            position_title: Some("Operator".into()),
            grade_interval: Some("G3".into()),
            phone: Some("0812".into()),
            day_type: Some("D1".into()),
            description: Some("Day shift".into()),
            time_in: Some("08:00".into()),
            time_out: Some("16:00".into()),
            next_day: Some("N".into()),
        }
    }

    #[test]
    fn content_hash_matches_pipe_joined_sha256() {
        let record = ScheduleRecord::from_raw(&sample_raw());
        assert_eq!(
            record.content_hash().as_str(),
            "29ece0e64ea9a8bfe4bf8b830768ee40ea448b6a709d112a7b51ce8e57cee9d2"
        );
    }

    #[test]
    fn missing_fields_hash_as_empty_strings() {
        let record = ScheduleRecord::from_raw(&RawScheduleRow {
            employee_id: "E9".into(),
            ..Default::default()
        });
        assert_eq!(
            record.content_hash().as_str(),
            "9f30deb2f9ec4e4d4364c3a33f4e1e6267f8af8001f504bd73d874549d315cf9"
        );
    }

    #[test]
    fn hash_ignores_construction_order_and_key() {
        let a = ScheduleRecord::from_raw(&sample_raw());
        let b = ScheduleRecord {
            next_day: "0".into(),
            time_out: "16:00".into(),
            time_in: "08:00".into(),
            description: "Day shift".into(),
            day_type: "D1".into(),
            phone: "0812".into(),
            grade_interval: "G3".into(),
            position_title: "Operator".into(),
            supervisor_name: "Bob".into(),
            supervisor_id: "S01".into(),
            section: "Shift A".into(),
            department: "Mining".into(),
            division: "Ops".into(),
            gender: "F".into(),
            employee_name: "Jane Doe".into(),
            employee_id: "other-key".into(),
        };
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn next_day_tokens_are_case_insensitive() {
        for token in ["y", "Y", "yes", "YES", "true", "True", "1", " yes "] {
            assert!(is_next_day(token), "{token}");
        }
        for token in ["", "0", "n", "no", "false", "2", "yess"] {
            assert!(!is_next_day(token), "{token}");
        }
        assert_eq!(next_day_flag(None), "0");
        assert_eq!(next_day_flag(Some("TRUE")), "1");
    }

    #[test]
    fn stored_and_upstream_forms_of_next_day_hash_alike() {
        let mut upstream = sample_raw();
        upstream.next_day = Some("true".into());
        let mut stored = sample_raw();
        stored.next_day = Some("1".into());
        assert_eq!(
            ScheduleRecord::from_raw(&upstream).content_hash(),
            ScheduleRecord::from_raw(&stored).content_hash()
        );
    }

    #[test]
    fn phone_truncates_to_exact_cap() {
        let mut record = ScheduleRecord::from_raw(&sample_raw());
        record.phone = "+62-812-3456-7890".into();
        let before = record.content_hash();
        record.truncate_phone(8);
        assert_eq!(record.phone, "+62-812-");
        assert_ne!(record.content_hash(), before);

        record.truncate_phone(0);
        assert_eq!(record.phone, "+62-812-");
        record.truncate_phone(20);
        assert_eq!(record.phone, "+62-812-");
    }

    #[test]
    fn detail_line_uses_pipe_layout() {
        let record = ScheduleRecord::from_raw(&sample_raw());
        assert_eq!(record.detail_line(), "E1 | Jane Doe | D1 | 08:00-16:00 | 0");
    }

    #[test]
    fn diff_reports_changed_columns_in_field_order() {
        let old = ScheduleRecord::from_raw(&sample_raw());
        let mut new = old.clone();
        new.time_out = "17:00".into();
        new.employee_name = "Jane D.".into();

        let changes = old.diff(&new);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "employee_name");
        assert_eq!(changes[1].field, "time_out");
        assert_eq!(changes[1].old_value, "16:00");
        assert_eq!(changes[1].new_value, "17:00");
        assert_eq!(changes[1].employee_id, "E1");
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn log_query_clamps_and_offsets() {
        let query = LogQuery {
            page: 0,
            page_size: 1000,
            before_id: None,
            only_with_changes: false,
        }
        .normalized();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, MAX_PAGE_SIZE);
        assert_eq!(query.offset(), 0);

        let third = LogQuery {
            page: 3,
            page_size: 10,
            ..LogQuery::default()
        };
        assert_eq!(third.offset(), 20);
    }

    #[test]
    fn cursor_overrides_page_number() {
        let query = LogQuery {
            page: 2,
            page_size: 2,
            before_id: Some(5),
            only_with_changes: false,
        };
        assert_eq!(query.offset(), 0);
        let query = query.normalized();
        assert_eq!(query.page, 1);
        assert_eq!(query.before_id, Some(5));
    }

    #[test]
    fn log_page_reports_cursor_only_for_full_pages() {
        let run = SyncRun::failed(Utc::now(), "boom");
        let entries = (0..2)
            .map(|i| SyncLogEntry {
                id: 10 - i,
                run: run.clone(),
            })
            .collect::<Vec<_>>();
        let query = LogQuery {
            page_size: 2,
            ..LogQuery::default()
        };
        let page = LogPage::new(entries.clone(), query, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.next_cursor, Some(9));

        let partial = LogPage::new(entries[..1].to_vec(), query, 1);
        assert_eq!(partial.total_pages, 1);
        assert_eq!(partial.next_cursor, None);

        let empty = LogPage::new(Vec::new(), LogQuery::default(), 0);
        assert_eq!(empty.total_pages, 1);
    }

    #[test]
    fn run_serializes_camel_case_for_the_admin_ui() {
        let run = SyncRun::failed(Utc::now(), "upstream unreachable");
        let json = serde_json::to_value(SyncLogEntry { id: 7, run }).expect("serialize");
        assert_eq!(json["id"], 7);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "upstream unreachable");
        assert!(json.get("detailsUpdated").is_some());
        assert!(json.get("runId").is_some());
    }
}
