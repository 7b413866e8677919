//! Grouped aggregation over an in-memory SQLite working set.
//!
//! Loading ([`EventFrame::load`]) and grouping ([`EventFrame::group`]) are
//! separate phases; one load can serve several groupings.

use crate::error::Result;
use crate::matcher::resolve_field;
use crate::window::WindowConfig;
use alarmd_common::types::Event;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

/// Columns that can be grouped on directly. Anything else is a label/tag key.
const EVENT_COLUMNS: &[&str] = &[
    "event_id",
    "external_id",
    "title",
    "description",
    "level",
    "service",
    "location",
    "resource_id",
    "resource_name",
    "resource_type",
    "event_type",
    "item",
    "source",
];

/// Grouping used when a strategy configures no dimensions: one group per event.
const DEFAULT_DIMENSION: &str = "event_id";

/// One group of events sharing the same dimension values.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub fingerprint: String,
    /// `(dimension, value)` in configured order. Missing values are `""`.
    pub dimensions: Vec<(String, String)>,
    pub event_ids: Vec<String>,
    pub event_count: i64,
    /// Highest level among the members.
    pub level: i64,
    /// Title of the latest member.
    pub title: String,
    pub description: String,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
}

/// Deterministic fingerprint of a strategy and its dimension values.
///
/// # Examples
///
/// ```
/// use alarmd_engine::aggregation::fingerprint;
///
/// let dims = vec![("service".to_string(), "api".to_string())];
/// let fp = fingerprint(7, &dims);
/// assert_eq!(fp.len(), 32);
/// assert_eq!(fp, fingerprint(7, &dims));
/// assert_ne!(fp, fingerprint(8, &dims));
///
/// let spoofed = vec![("service".to_string(), "api|service=db".to_string())];
/// let split = vec![
///     ("service".to_string(), "api".to_string()),
///     ("service".to_string(), "db".to_string()),
/// ];
/// assert_ne!(fingerprint(7, &spoofed), fingerprint(7, &split));
/// ```
pub fn fingerprint(strategy_id: i64, dimensions: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy_id.to_be_bytes());
    // Length-prefixed so that no value can mimic a field separator.
    for (key, value) in dimensions {
        for part in [key, value] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(32);
    digest
}

/// Resolves configured dimensions, falling back to one group per event.
pub fn effective_dimensions(group_by: &[String]) -> Vec<String> {
    let dims: Vec<String> = group_by
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(|d| resolve_field(d).to_string())
        .collect();
    if dims.is_empty() {
        vec![DEFAULT_DIMENSION.to_string()]
    } else {
        dims
    }
}

/// A batch of events loaded into an in-memory SQLite database.
///
/// `received_at` is stored as nanoseconds for ordering only; group bounds
/// are read back from `received` by `seq`, so they keep full precision.
pub struct EventFrame {
    conn: Connection,
    received: Vec<DateTime<Utc>>,
}

impl EventFrame {
    /// Phase one: load `events` into the `events` and `event_labels` tables.
    /// Labels shadow tags with the same key.
    pub fn load<'a, I>(events: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE events (
                seq INTEGER PRIMARY KEY,
                event_id TEXT NOT NULL,
                external_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                level INTEGER NOT NULL,
                service TEXT,
                location TEXT,
                resource_id TEXT,
                resource_name TEXT,
                resource_type TEXT,
                event_type TEXT,
                item TEXT,
                source TEXT,
                received_at INTEGER NOT NULL
            );
            CREATE TABLE event_labels (
                seq INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (seq, key)
            );",
        )?;

        let mut received = Vec::new();
        let tx = conn.transaction()?;
        {
            let mut insert_event = tx.prepare_cached(
                "INSERT INTO events (seq, event_id, external_id, title, description, level,
                    service, location, resource_id, resource_name, resource_type, event_type,
                    item, source, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            let mut insert_label = tx.prepare_cached(
                "INSERT OR IGNORE INTO event_labels (seq, key, value) VALUES (?1, ?2, ?3)",
            )?;

            for (seq, event) in events.into_iter().enumerate() {
                let seq = seq as i64;
                insert_event.execute(params![
                    seq,
                    event.event_id,
                    event.external_id,
                    event.title,
                    event.description,
                    event.level,
                    event.service,
                    event.location,
                    event.resource_id,
                    event.resource_name,
                    event.resource_type,
                    event.event_type,
                    event.item,
                    event.source,
                    sort_key(&event.received_at),
                ])?;
                for (key, value) in event.labels.iter().chain(event.tags.iter()) {
                    insert_label.execute(params![seq, key, value])?;
                }
                received.push(event.received_at);
            }
        }
        tx.commit()?;

        Ok(Self { conn, received })
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    fn received_at(&self, seq: i64) -> DateTime<Utc> {
        usize::try_from(seq)
            .ok()
            .and_then(|i| self.received.get(i))
            .copied()
            .unwrap_or_default()
    }

    /// Phase two: one result per distinct tuple of `dimensions` values,
    /// ordered by first event time.
    pub fn group(&self, dimensions: &[String], strategy_id: i64) -> Result<Vec<AggregationResult>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let dims = effective_dimensions(dimensions);
        let (sql, label_keys) = build_group_query(&dims);

        let mut stmt = self.conn.prepare(&sql)?;
        let n = dims.len();
        let rows = stmt.query_map(rusqlite::params_from_iter(label_keys.iter()), |row| {
            let mut values = Vec::with_capacity(n);
            for i in 0..n {
                values.push(row.get::<_, String>(i)?);
            }
            Ok(RawGroup {
                values,
                level: row.get(n)?,
                first_seq: row.get(n + 1)?,
                last_seq: row.get(n + 2)?,
                count: row.get(n + 3)?,
                event_ids_json: row.get(n + 4)?,
                title: row.get::<_, Option<String>>(n + 5)?.unwrap_or_default(),
                description: row.get::<_, Option<String>>(n + 6)?.unwrap_or_default(),
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            let raw = row?;
            let dimensions: Vec<(String, String)> =
                dims.iter().cloned().zip(raw.values.into_iter()).collect();
            let event_ids: Vec<String> = serde_json::from_str(&raw.event_ids_json)?;
            results.push(AggregationResult {
                fingerprint: fingerprint(strategy_id, &dimensions),
                dimensions,
                event_ids,
                event_count: raw.count,
                level: raw.level,
                title: raw.title,
                description: raw.description,
                first_event_time: self.received_at(raw.first_seq),
                last_event_time: self.received_at(raw.last_seq),
            });
        }
        Ok(results)
    }
}

struct RawGroup {
    values: Vec<String>,
    level: i64,
    first_seq: i64,
    last_seq: i64,
    count: i64,
    event_ids_json: String,
    title: String,
    description: String,
}

/// Builds the grouping statement. Built-in columns are inlined from
/// [`EVENT_COLUMNS`]; label keys are bound parameters.
fn build_group_query(dims: &[String]) -> (String, Vec<String>) {
    let mut selects = Vec::with_capacity(dims.len());
    let mut joins = String::new();
    let mut label_keys = Vec::new();

    for (i, dim) in dims.iter().enumerate() {
        match EVENT_COLUMNS.iter().find(|c| **c == dim.as_str()) {
            Some(col) => selects.push(format!("COALESCE(CAST(e.{col} AS TEXT), '') AS d{i}")),
            None => {
                label_keys.push(dim.clone());
                let p = label_keys.len();
                joins.push_str(&format!(
                    " LEFT JOIN event_labels l{i} ON l{i}.seq = e.seq AND l{i}.key = ?{p}"
                ));
                selects.push(format!("COALESCE(l{i}.value, '') AS d{i}"));
            }
        }
    }

    let dim_cols: Vec<String> = (0..dims.len()).map(|i| format!("d{i}")).collect();
    let dim_list = dim_cols.join(", ");
    let sql = format!(
        "WITH base AS (
            SELECT e.seq, e.event_id, e.level, e.title, e.description, e.received_at, {selects}
            FROM events e{joins}
        ),
        ranked AS (
            SELECT base.*,
                ROW_NUMBER() OVER (
                    PARTITION BY {dim_list} ORDER BY received_at DESC, seq DESC
                ) AS rn,
                ROW_NUMBER() OVER (
                    PARTITION BY {dim_list} ORDER BY received_at ASC, seq ASC
                ) AS rn_first
            FROM base
        )
        SELECT {dim_list},
            MAX(level),
            MAX(CASE WHEN rn_first = 1 THEN seq END),
            MAX(CASE WHEN rn = 1 THEN seq END),
            COUNT(*),
            json_group_array(event_id),
            MAX(CASE WHEN rn = 1 THEN title END),
            MAX(CASE WHEN rn = 1 THEN description END)
        FROM ranked
        GROUP BY {dim_list}
        ORDER BY MIN(received_at), {dim_list}",
        selects = selects.join(", "),
    );
    (sql, label_keys)
}

/// Nanoseconds since the epoch, saturating outside the range `i64` covers.
fn sort_key(at: &DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1_000))
}

/// Loads `events` and groups them by `dimensions` in one call.
pub fn aggregate(
    events: &[&Event],
    dimensions: &[String],
    window: &WindowConfig,
    strategy_id: i64,
) -> Result<Vec<AggregationResult>> {
    if events.is_empty() {
        return Ok(Vec::new());
    }
    let frame = EventFrame::load(events.iter().copied())?;
    let results = frame.group(dimensions, strategy_id)?;
    tracing::debug!(
        strategy_id,
        window_type = %window.window_type,
        events = frame.len(),
        groups = results.len(),
        "Aggregated events"
    );
    Ok(results)
}
