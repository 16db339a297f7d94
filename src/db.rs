// 🗄️ SQLite Store - Source rows, rules, ledger entries and the audit trail
//
// Tables:
//   source_rows     one JSON document per source record, tagged with its dataset
//   ledger_rules    rules as data
//   ledger_entries  run output, unique by idempotency hash
//   events          audit trail

use crate::executor::{QueryExecutor, ResultRow};
use crate::plan::{AggregationPlan, MatchValue};
use crate::processor::LedgerEntry;
use crate::rules::{RuleDefinition, RuleSource};
use crate::sink::ResultSink;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Event for audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Source rows (schemaless: every dataset shares one table)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset TEXT NOT NULL,
            data TEXT NOT NULL,
            loaded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Rules
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_name TEXT UNIQUE NOT NULL,
            external_id TEXT,
            source_table TEXT NOT NULL,
            ledger_definition TEXT NOT NULL,
            data_definition TEXT NOT NULL,
            filter TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Ledger entries
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            entry_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            valuation_dt TEXT NOT NULL,
            account TEXT NOT NULL,
            entity_id TEXT,
            ledger_account TEXT NOT NULL,
            account_kind TEXT NOT NULL,
            calculated_value REAL NOT NULL,
            formula TEXT NOT NULL,
            account_template TEXT NOT NULL,
            source_data TEXT NOT NULL,
            processed_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_source_dataset ON source_rows(dataset)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_run ON ledger_entries(run_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_ledger_account ON ledger_entries(ledger_account)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SOURCE DATA
// ============================================================================

/// Read a JSON array of objects; anything that is not an object is rejected
pub fn load_records_json(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read data file: {:?}", path))?;
    let value: Value = serde_json::from_str(&content).context("Failed to parse data JSON")?;

    let Value::Array(items) = value else {
        return Err(anyhow!("Data file must contain a JSON array: {:?}", path));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("Record {} in {:?} is not an object", i, path)),
        })
        .collect()
}

/// Read a CSV file with a header row; cell text is typed (null, bool, integer, float, text)
pub fn load_records_csv(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut rdr = csv::Reader::from_path(path).context("Failed to open CSV file")?;
    let headers = rdr.headers().context("Failed to read CSV header")?.clone();

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result.context("Failed to read CSV row")?;
        let mut record = Map::new();
        for (name, cell) in headers.iter().zip(row.iter()) {
            record.insert(name.to_string(), typed_cell(cell));
        }
        records.push(record);
    }

    Ok(records)
}

fn typed_cell(cell: &str) -> Value {
    let cell = cell.trim();
    if cell.is_empty() {
        return Value::Null;
    }
    match cell {
        "true" | "TRUE" | "True" => return Value::Bool(true),
        "false" | "FALSE" | "False" => return Value::Bool(false),
        _ => {}
    }
    // Codes such as "001" keep their leading zeros
    let digits = cell.trim_start_matches('-');
    if digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.") {
        return Value::String(cell.to_string());
    }
    if let Ok(i) = cell.parse::<i64>() {
        return json!(i);
    }
    match cell.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => Value::String(cell.to_string()),
    }
}

/// Load a data file (.json or .csv) by extension
pub fn load_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref() {
        Some("json") => load_records_json(path),
        Some("csv") => load_records_csv(path),
        _ => Err(anyhow!("Unsupported data file (expected .json or .csv): {:?}", path)),
    }
}

pub fn insert_source_rows(
    conn: &Connection,
    dataset: &str,
    records: &[Map<String, Value>],
) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare("INSERT INTO source_rows (dataset, data) VALUES (?1, ?2)")?;
        for record in records {
            stmt.execute(params![dataset, serde_json::to_string(record)?])?;
        }
    }
    tx.commit()?;

    let event = Event::new(
        "dataset_loaded",
        "dataset",
        dataset,
        json!({ "rows": records.len() }),
        "data_importer",
    );
    // Rows are committed at this point; a failed audit write is reported, not fatal
    if let Err(e) = insert_event(conn, &event) {
        warn!("⚠️  Dataset '{}' loaded but its audit event was not recorded: {:#}", dataset, e);
    }

    Ok(records.len())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetStat {
    pub dataset: String,
    pub rows: i64,
}

pub fn get_dataset_stats(conn: &Connection) -> Result<Vec<DatasetStat>> {
    let mut stmt = conn.prepare(
        "SELECT dataset, COUNT(*) FROM source_rows GROUP BY dataset ORDER BY dataset",
    )?;

    let stats = stmt
        .query_map([], |row| {
            Ok(DatasetStat {
                dataset: row.get(0)?,
                rows: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

// ============================================================================
// QUERY EXECUTOR
// ============================================================================

/// JSON path for a top-level key; the key is quoted so dots stay literal
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field)
}

/// Collects positional parameters while the SQL text is built
#[derive(Default)]
struct Binder {
    values: Vec<SqlValue>,
}

impl Binder {
    fn bind(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn path(&mut self, field: &str) -> String {
        self.bind(SqlValue::Text(json_path(field)))
    }
}

/// SQL for one plan; field names only ever travel as bound parameters
fn plan_sql(plan: &AggregationPlan) -> (String, Vec<SqlValue>) {
    let mut binder = Binder::default();

    let dataset = binder.bind(SqlValue::Text(plan.source_table.clone()));
    let mut filter = String::new();
    if let Some(constraint) = &plan.match_constraint {
        let path = binder.path(&constraint.field);
        filter = match &constraint.value {
            MatchValue::Bool(b) => {
                let v = binder.bind(SqlValue::Text(b.to_string()));
                format!(" AND json_type(data, {path}) = {v}")
            }
            MatchValue::Integer(i) => {
                let v = binder.bind(SqlValue::Integer(*i));
                format!(
                    " AND json_type(data, {path}) IN ('integer', 'real') AND json_extract(data, {path}) = {v}"
                )
            }
            MatchValue::Float(f) => {
                let v = binder.bind(SqlValue::Real(*f));
                format!(
                    " AND json_type(data, {path}) IN ('integer', 'real') AND json_extract(data, {path}) = {v}"
                )
            }
            MatchValue::Text(s) => {
                let v = binder.bind(SqlValue::Text(s.clone()));
                format!(" AND json_type(data, {path}) = 'text' AND json_extract(data, {path}) = {v}")
            }
        };
    }

    let valuation = binder.path(&plan.group_key.valuation);
    let account = binder.path(&plan.group_key.account);

    let mut sums = String::new();
    for (i, field) in plan.summed.iter().enumerate() {
        let path = binder.path(&field.field);
        sums.push_str(&format!(
            ",\n COALESCE(SUM(CASE WHEN json_type(data, {path}) IN ('integer', 'real') \
             THEN json_extract(data, {path}) END), 0) AS s{i}"
        ));
    }

    let mut columns = format!("head.data -> {valuation}, head.data -> {account}");
    for field in &plan.passthrough {
        let path = binder.path(&field.field);
        columns.push_str(&format!(", head.data -> {path}"));
    }
    for i in 0..plan.summed.len() {
        columns.push_str(&format!(", grouped.s{i}"));
    }

    let sql = format!(
        "WITH filtered AS (
            SELECT id, data FROM source_rows WHERE dataset = {dataset}{filter}
        ),
        grouped AS (
            SELECT json_extract(data, {valuation}) AS g_valuation,
                   json_extract(data, {account}) AS g_account,
                   MIN(id) AS first_id{sums}
            FROM filtered
            GROUP BY g_valuation, g_account
        )
        SELECT {columns}
        FROM grouped JOIN source_rows AS head ON head.id = grouped.first_id
        ORDER BY grouped.g_valuation, grouped.g_account"
    );

    (sql, binder.values)
}

fn json_from_text(text: Option<String>) -> Result<Value> {
    match text {
        None => Ok(Value::Null),
        Some(t) => serde_json::from_str(&t).context("Invalid JSON value in source row"),
    }
}

fn json_from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Integer(i) => json!(i),
        SqlValue::Real(f) => json!(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Null | SqlValue::Blob(_) => json!(0),
    }
}

/// Runs plans as one GROUP BY statement against `source_rows`
#[derive(Clone)]
pub struct SqliteExecutor {
    db: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        SqliteExecutor { db }
    }

    pub fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

impl QueryExecutor for SqliteExecutor {
    fn execute(&self, plan: &AggregationPlan) -> Result<Vec<ResultRow>> {
        let (sql, values) = plan_sql(plan);
        debug!("SQL for '{}': {}", plan.source_table, sql);

        let conn = self
            .db
            .lock()
            .map_err(|_| anyhow!("Database lock poisoned"))?;
        let mut stmt = conn.prepare(&sql).context("Failed to prepare aggregation query")?;

        let group_width = 2 + plan.passthrough.len();
        let raw_rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                let mut texts: Vec<Option<String>> = Vec::with_capacity(group_width);
                for i in 0..group_width {
                    texts.push(row.get(i)?);
                }
                let mut sums: Vec<SqlValue> = Vec::with_capacity(plan.summed.len());
                for i in 0..plan.summed.len() {
                    sums.push(row.get(group_width + i)?);
                }
                Ok((texts, sums))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Aggregation query failed")?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for (texts, sums) in raw_rows {
            let mut texts = texts.into_iter();
            let mut values = Map::new();
            values.insert(
                plan.group_key.valuation.clone(),
                json_from_text(texts.next().flatten())?,
            );
            values.insert(
                plan.group_key.account.clone(),
                json_from_text(texts.next().flatten())?,
            );
            for (field, text) in plan.passthrough.iter().zip(texts) {
                values.insert(field.output.clone(), json_from_text(text)?);
            }
            for (field, sum) in plan.summed.iter().zip(sums) {
                values.insert(field.output.clone(), json_from_sql(sum));
            }
            rows.push(ResultRow::new(values));
        }

        Ok(rows)
    }
}

// ============================================================================
// RULES
// ============================================================================

/// Insert or replace rules by name
pub fn insert_rules(conn: &Connection, rules: &[RuleDefinition]) -> Result<usize> {
    let mut stored = 0;
    for rule in rules {
        conn.execute(
            "INSERT INTO ledger_rules (
                rule_name, external_id, source_table, ledger_definition,
                data_definition, filter, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(rule_name) DO UPDATE SET
                external_id = excluded.external_id,
                source_table = excluded.source_table,
                ledger_definition = excluded.ledger_definition,
                data_definition = excluded.data_definition,
                filter = excluded.filter,
                status = excluded.status,
                updated_at = CURRENT_TIMESTAMP",
            params![
                rule.rule_name,
                rule.id,
                rule.source_table,
                rule.account_template,
                rule.formula,
                rule.filter,
                rule.status.as_str(),
            ],
        )
        .with_context(|| format!("Failed to store rule '{}'", rule.display_name()))?;
        stored += 1;
    }

    Ok(stored)
}

pub fn get_rules(conn: &Connection) -> Result<Vec<RuleDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT external_id, rule_name, source_table, ledger_definition,
                data_definition, filter, status
         FROM ledger_rules
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                RuleDefinition::new(
                    &row.get::<_, String>(1)?,
                    &row.get::<_, String>(2)?,
                    &row.get::<_, String>(3)?,
                    &row.get::<_, String>(4)?,
                    &row.get::<_, String>(5)?,
                ),
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, mut rule, status)| {
            rule.id = id;
            rule.status = status.parse().map_err(|e: String| anyhow!(e))?;
            Ok(rule)
        })
        .collect()
}

/// Rules read from the `ledger_rules` table.
/// The lock is taken per read, so the store can sit next to a `SqliteExecutor` on the same database.
#[derive(Clone)]
pub struct SqliteRuleStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRuleStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        SqliteRuleStore { db }
    }
}

impl RuleSource for SqliteRuleStore {
    fn all_rules(&self) -> Result<Vec<RuleDefinition>> {
        let conn = self
            .db
            .lock()
            .map_err(|_| anyhow!("Database lock poisoned"))?;
        get_rules(&conn)
    }
}

// ============================================================================
// LEDGER ENTRIES
// ============================================================================

/// Insert entries; an entry whose hash is already stored is skipped
pub fn insert_entries(conn: &Connection, entries: &[LedgerEntry]) -> Result<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    let tx = conn.unchecked_transaction()?;
    for entry in entries {
        let result = tx.execute(
            "INSERT INTO ledger_entries (
                idempotency_hash, entry_id, run_id, rule_name, valuation_dt, account,
                entity_id, ledger_account, account_kind, calculated_value, formula,
                account_template, source_data, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.idempotency_hash(),
                entry.entry_id,
                entry.run_id,
                entry.rule_name,
                entry.valuation_dt,
                entry.account,
                entry.entity_id,
                entry.ledger_account,
                entry.account_kind.as_str(),
                entry.calculated_value,
                entry.formula,
                entry.account_template,
                serde_json::to_string(&entry.source_data)?,
                entry.processed_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    tx.commit()?;

    debug!("Inserted {} entries, skipped {} duplicates", inserted, duplicates);
    Ok(inserted)
}

/// Entries in insertion order, optionally for one run
pub fn get_entries(conn: &Connection, run_id: Option<&str>) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, run_id, rule_name, valuation_dt, account, entity_id,
                ledger_account, account_kind, calculated_value, formula,
                account_template, source_data, processed_at
         FROM ledger_entries
         WHERE ?1 IS NULL OR run_id = ?1
         ORDER BY id",
    )?;

    let entries = stmt
        .query_map(params![run_id], |row| {
            let kind: String = row.get(7)?;
            let source_json: String = row.get(11)?;
            let processed_at: String = row.get(12)?;

            Ok(LedgerEntry {
                entry_id: row.get(0)?,
                run_id: row.get(1)?,
                rule_name: row.get(2)?,
                valuation_dt: row.get(3)?,
                account: row.get(4)?,
                entity_id: row.get(5)?,
                ledger_account: row.get(6)?,
                account_kind: serde_json::from_value(Value::String(kind))
                    .map_err(|e| text_conversion_error(7, e))?,
                calculated_value: row.get(8)?,
                formula: row.get(9)?,
                account_template: row.get(10)?,
                source_data: serde_json::from_str(&source_json)
                    .map_err(|e| text_conversion_error(11, e))?,
                processed_at: DateTime::parse_from_rfc3339(&processed_at)
                    .map_err(|e| text_conversion_error(12, e))?
                    .with_timezone(&Utc),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn count_entries(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
    Ok(count)
}

/// Persists entries into `ledger_entries`
pub struct SqliteSink<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSink<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteSink { conn }
    }
}

impl ResultSink for SqliteSink<'_> {
    fn write(&self, entries: &[LedgerEntry]) -> Result<usize> {
        insert_entries(self.conn, entries)
    }
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Text column that did not decode into its Rust type
fn text_conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

/// Append one audit event
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )
    .with_context(|| {
        format!(
            "Failed to record '{}' event for {} '{}'",
            event.event_type, event.entity_type, event.entity_id
        )
    })?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let recorded_at: String = row.get(1)?;
            let payload: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| text_conversion_error(1, e))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&payload).map_err(|e| text_conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
