// 🗄️ SQLite persistence - formula registry, estimates, snapshots, audit trail
//
// One connection behind a mutex. Every audited write (publishing a version,
// recording a snapshot, updating pricing) runs in an IMMEDIATE transaction
// together with its event, so either both land or neither does.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::EstimateStore;
use crate::error::{Error, Result};
use crate::estimate::{Estimate, LineItem, PricingPolicy};
use crate::formula::{FormulaDraft, FormulaRegistry, FormulaVersion, InputDecl, Value};
use crate::provenance::{SnapshotParts, UsageSnapshot};

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail ("every change is an event")
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

    pub fn snapshot_recorded(snapshot: &UsageSnapshot) -> Self {
        Self::new(
            "snapshot_recorded",
            "line_item",
            snapshot.line_item_id(),
            serde_json::json!({
                "snapshot_id": snapshot.id(),
                "formula_key": snapshot.formula_key(),
                "formula_sequence": snapshot.formula_sequence(),
                "digest": snapshot.digest(),
            }),
            snapshot.triggered_by(),
        )
    }

    pub fn pricing_updated(organization_id: &str, policy: &PricingPolicy) -> Result<Self> {
        Ok(Self::new(
            "pricing_updated",
            "organization",
            organization_id,
            serde_json::to_value(policy)?,
            "config",
        ))
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Formula versions (append-only; (key, sequence) never reused)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS formula_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            formula_key TEXT NOT NULL,
            sequence INTEGER NOT NULL CHECK (sequence >= 1),
            body TEXT NOT NULL,
            inputs TEXT NOT NULL,
            outputs TEXT NOT NULL,
            author TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (formula_key, sequence)
        )",
        [],
    )?;

    // ==========================================================================
    // Estimates + line items
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS estimates (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            name TEXT NOT NULL,
            pricing TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY,
            estimate_id TEXT NOT NULL REFERENCES estimates(id),
            position INTEGER NOT NULL,
            description TEXT NOT NULL,
            formula_key TEXT,
            inputs TEXT NOT NULL,
            manual_amount TEXT,
            total_output TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Usage snapshots (append-only; rowid order = creation order)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS usage_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id TEXT UNIQUE NOT NULL,
            line_item_id TEXT NOT NULL REFERENCES line_items(id),
            formula_key TEXT NOT NULL,
            formula_sequence INTEGER NOT NULL,
            inputs TEXT NOT NULL,
            outputs TEXT NOT NULL,
            line_total_output TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            digest TEXT NOT NULL,
            FOREIGN KEY (formula_key, formula_sequence)
                REFERENCES formula_versions(formula_key, sequence)
        )",
        [],
    )?;

    // ==========================================================================
    // Organization pricing policy
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS organization_pricing (
            organization_id TEXT PRIMARY KEY,
            policy TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail / event sourcing)
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
        "CREATE INDEX IF NOT EXISTS idx_line_items_estimate ON line_items(estimate_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_line_item ON usage_snapshots(line_item_id, id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt {
            table,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn parse_json<T: DeserializeOwned>(table: &'static str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Corrupt {
        table,
        reason: format!("bad JSON column: {}", e),
    })
}

fn parse_decimal(table: &'static str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| Error::Corrupt {
        table,
        reason: format!("bad decimal '{}': {}", raw, e),
    })
}

struct VersionRow {
    key: String,
    sequence: u32,
    body: String,
    inputs: String,
    outputs: String,
    author: String,
    created_at: String,
}

impl VersionRow {
    const COLUMNS: &'static str =
        "formula_key, sequence, body, inputs, outputs, author, created_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(VersionRow {
            key: row.get(0)?,
            sequence: row.get(1)?,
            body: row.get(2)?,
            inputs: row.get(3)?,
            outputs: row.get(4)?,
            author: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    /// Re-parse the stored body. A row that no longer validates is corrupt.
    fn into_version(self) -> Result<FormulaVersion> {
        const TABLE: &str = "formula_versions";
        let inputs: Vec<InputDecl> = parse_json(TABLE, &self.inputs)?;
        let outputs: Vec<String> = parse_json(TABLE, &self.outputs)?;
        let created_at = parse_timestamp(TABLE, &self.created_at)?;

        let draft = FormulaDraft {
            key: self.key,
            body: self.body,
            inputs,
            outputs,
            author: self.author,
        };
        FormulaVersion::new(draft, self.sequence, created_at).map_err(|e| Error::Corrupt {
            table: TABLE,
            reason: e.to_string(),
        })
    }
}

struct EstimateRow {
    id: String,
    organization_id: String,
    name: String,
    pricing: String,
    created_at: String,
}

impl EstimateRow {
    const COLUMNS: &'static str = "id, organization_id, name, pricing, created_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(EstimateRow {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            pricing: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_estimate(self) -> Result<Estimate> {
        Ok(Estimate {
            pricing: parse_json("estimates", &self.pricing)?,
            created_at: parse_timestamp("estimates", &self.created_at)?,
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
        })
    }
}

struct LineItemRow {
    id: String,
    estimate_id: String,
    position: u32,
    description: String,
    formula_key: Option<String>,
    inputs: String,
    manual_amount: Option<String>,
    total_output: Option<String>,
}

impl LineItemRow {
    const COLUMNS: &'static str =
        "id, estimate_id, position, description, formula_key, inputs, manual_amount, total_output";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(LineItemRow {
            id: row.get(0)?,
            estimate_id: row.get(1)?,
            position: row.get(2)?,
            description: row.get(3)?,
            formula_key: row.get(4)?,
            inputs: row.get(5)?,
            manual_amount: row.get(6)?,
            total_output: row.get(7)?,
        })
    }

    fn into_line_item(self) -> Result<LineItem> {
        let manual_amount = match self.manual_amount {
            Some(raw) => Some(parse_decimal("line_items", &raw)?),
            None => None,
        };
        Ok(LineItem {
            inputs: parse_json("line_items", &self.inputs)?,
            id: self.id,
            estimate_id: self.estimate_id,
            position: self.position,
            description: self.description,
            formula_key: self.formula_key,
            manual_amount,
            total_output: self.total_output,
        })
    }
}

struct SnapshotRow {
    snapshot_id: String,
    line_item_id: String,
    formula_key: String,
    formula_sequence: u32,
    inputs: String,
    outputs: String,
    line_total_output: String,
    computed_at: String,
    triggered_by: String,
    digest: String,
}

impl SnapshotRow {
    const COLUMNS: &'static str = "snapshot_id, line_item_id, formula_key, formula_sequence, inputs, outputs, \
         line_total_output, computed_at, triggered_by, digest";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(SnapshotRow {
            snapshot_id: row.get(0)?,
            line_item_id: row.get(1)?,
            formula_key: row.get(2)?,
            formula_sequence: row.get(3)?,
            inputs: row.get(4)?,
            outputs: row.get(5)?,
            line_total_output: row.get(6)?,
            computed_at: row.get(7)?,
            triggered_by: row.get(8)?,
            digest: row.get(9)?,
        })
    }

    fn into_snapshot(self) -> Result<UsageSnapshot> {
        const TABLE: &str = "usage_snapshots";
        let inputs: BTreeMap<String, Value> = parse_json(TABLE, &self.inputs)?;
        let outputs: BTreeMap<String, Value> = parse_json(TABLE, &self.outputs)?;
        Ok(UsageSnapshot::restore(SnapshotParts {
            id: self.snapshot_id,
            line_item_id: self.line_item_id,
            formula_key: self.formula_key,
            formula_sequence: self.formula_sequence,
            inputs,
            outputs,
            line_total_output: self.line_total_output,
            computed_at: parse_timestamp(TABLE, &self.computed_at)?,
            triggered_by: self.triggered_by,
            digest: self.digest,
        }))
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-backed formula registry and estimate store.
pub struct SqliteStore {
    conn: Mutex<Connection>,

    /// Versions are immutable, so a parsed copy never goes stale
    versions: RwLock<HashMap<(String, u32), Arc<FormulaVersion>>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            versions: RwLock::new(HashMap::new()),
        })
    }

    /// Audit events for one entity, oldest first.
    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map(params![entity_type, entity_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(event_id, ts, event_type, entity_type, entity_id, data, actor)| {
                    Ok(Event {
                        event_id,
                        timestamp: parse_timestamp("events", &ts)?,
                        event_type,
                        entity_type,
                        entity_id,
                        data: parse_json("events", &data)?,
                        actor,
                    })
                },
            )
            .collect()
    }

    fn cached(&self, key: &str, sequence: u32) -> Option<Arc<FormulaVersion>> {
        self.versions
            .read()
            .get(&(key.to_string(), sequence))
            .cloned()
    }

    fn cache(&self, version: FormulaVersion) -> Arc<FormulaVersion> {
        let version = Arc::new(version);
        self.versions.write().insert(
            (version.key().to_string(), version.sequence()),
            Arc::clone(&version),
        );
        version
    }

    fn load_version(&self, conn: &Connection, key: &str, sequence: u32) -> Result<Option<Arc<FormulaVersion>>> {
        if let Some(version) = self.cached(key, sequence) {
            return Ok(Some(version));
        }

        let sql = format!(
            "SELECT {} FROM formula_versions WHERE formula_key = ?1 AND sequence = ?2",
            VersionRow::COLUMNS
        );
        let row = conn
            .query_row(&sql, params![key, sequence], VersionRow::from_row)
            .optional()?;

        match row {
            Some(row) => Ok(Some(self.cache(row.into_version()?))),
            None => Ok(None),
        }
    }

    fn insert_version(tx: &Transaction<'_>, version: &FormulaVersion) -> Result<()> {
        let result = tx.execute(
            "INSERT INTO formula_versions (
                formula_key, sequence, body, inputs, outputs, author, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.key(),
                version.sequence(),
                version.body_source(),
                serde_json::to_string(version.inputs())?,
                serde_json::to_string(version.outputs())?,
                version.author(),
                timestamp(&version.created_at()),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::PublishConflict {
                key: version.key().to_string(),
                expected: version.sequence(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl FormulaRegistry for SqliteStore {
    fn current_version(&self, key: &str) -> Result<Arc<FormulaVersion>> {
        let conn = self.conn.lock();
        let current: Option<u32> = conn.query_row(
            "SELECT MAX(sequence) FROM formula_versions WHERE formula_key = ?1",
            params![key],
            |row| row.get(0),
        )?;

        let not_found = || Error::FormulaNotFound {
            key: key.to_string(),
        };
        let sequence = current.ok_or_else(not_found)?;
        self.load_version(&conn, key, sequence)?.ok_or_else(not_found)
    }

    fn version(&self, key: &str, sequence: u32) -> Result<Arc<FormulaVersion>> {
        if let Some(version) = self.cached(key, sequence) {
            return Ok(version);
        }
        let conn = self.conn.lock();
        self.load_version(&conn, key, sequence)?
            .ok_or_else(|| Error::VersionNotFound {
                key: key.to_string(),
                sequence,
            })
    }

    fn publish(&self, draft: FormulaDraft) -> Result<Arc<FormulaVersion>> {
        // Reject bad drafts before taking the write lock
        draft.validate()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: u32 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM formula_versions WHERE formula_key = ?1",
            params![draft.key],
            |row| row.get(0),
        )?;
        let version = FormulaVersion::new(draft, previous + 1, Utc::now().trunc_subsecs(6))?;
        Self::insert_version(&tx, &version)?;

        let event = Event::new(
            "formula_published",
            "formula",
            version.key(),
            serde_json::json!({
                "sequence": version.sequence(),
                "inputs": version.inputs(),
                "outputs": version.outputs(),
            }),
            version.author(),
        );
        insert_event(&tx, &event)?;
        tx.commit()?;

        info!(
            formula_key = version.key(),
            sequence = version.sequence(),
            author = version.author(),
            "published formula version"
        );
        Ok(self.cache(version))
    }

    fn history(&self, key: &str) -> Result<Vec<Arc<FormulaVersion>>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM formula_versions WHERE formula_key = ?1 ORDER BY sequence ASC",
            VersionRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![key], VersionRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Err(Error::FormulaNotFound {
                key: key.to_string(),
            });
        }

        rows.into_iter()
            .map(|row| match self.cached(&row.key, row.sequence) {
                Some(version) => Ok(version),
                None => Ok(self.cache(row.into_version()?)),
            })
            .collect()
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT formula_key FROM formula_versions ORDER BY formula_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

impl EstimateStore for SqliteStore {
    fn create_estimate(&self, estimate: &Estimate) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO estimates (id, organization_id, name, pricing, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, pricing = excluded.pricing",
            params![
                estimate.id,
                estimate.organization_id,
                estimate.name,
                serde_json::to_string(&estimate.pricing)?,
                timestamp(&estimate.created_at),
            ],
        )?;
        Ok(())
    }

    fn estimate(&self, id: &str) -> Result<Estimate> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM estimates WHERE id = ?1", EstimateRow::COLUMNS);
        conn.query_row(&sql, params![id], EstimateRow::from_row)
            .optional()?
            .ok_or_else(|| Error::EstimateNotFound { id: id.to_string() })?
            .into_estimate()
    }

    fn estimates(&self) -> Result<Vec<Estimate>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM estimates ORDER BY created_at ASC, id ASC",
            EstimateRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], EstimateRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(EstimateRow::into_estimate).collect()
    }

    fn save_line_item(&self, item: &LineItem) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM estimates WHERE id = ?1)",
            params![item.estimate_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::EstimateNotFound {
                id: item.estimate_id.clone(),
            });
        }

        let owner: Option<String> = tx
            .query_row(
                "SELECT estimate_id FROM line_items WHERE id = ?1",
                params![item.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = owner.filter(|owner| *owner != item.estimate_id) {
            return Err(Error::LineItemMoved {
                id: item.id.clone(),
                from: owner,
                to: item.estimate_id.clone(),
            });
        }

        tx.execute(
            "INSERT INTO line_items (
                id, estimate_id, position, description, formula_key, inputs,
                manual_amount, total_output, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                position = excluded.position,
                description = excluded.description,
                formula_key = excluded.formula_key,
                inputs = excluded.inputs,
                manual_amount = excluded.manual_amount,
                total_output = excluded.total_output,
                updated_at = excluded.updated_at",
            params![
                item.id,
                item.estimate_id,
                item.position,
                item.description,
                item.formula_key,
                serde_json::to_string(&item.inputs)?,
                item.manual_amount.map(|a| a.to_string()),
                item.total_output,
                timestamp(&Utc::now()),
            ],
        )?;
        tx.commit()?;
        debug!(line_item_id = %item.id, "saved line item");
        Ok(())
    }

    fn line_item(&self, id: &str) -> Result<LineItem> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM line_items WHERE id = ?1", LineItemRow::COLUMNS);
        conn.query_row(&sql, params![id], LineItemRow::from_row)
            .optional()?
            .ok_or_else(|| Error::LineItemNotFound { id: id.to_string() })?
            .into_line_item()
    }

    fn line_items(&self, estimate_id: &str) -> Result<Vec<LineItem>> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM estimates WHERE id = ?1)",
            params![estimate_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::EstimateNotFound {
                id: estimate_id.to_string(),
            });
        }

        let sql = format!(
            "SELECT {} FROM line_items WHERE estimate_id = ?1 ORDER BY position ASC, id ASC",
            LineItemRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![estimate_id], LineItemRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(LineItemRow::into_line_item).collect()
    }

    fn append_snapshot(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM line_items WHERE id = ?1)",
            params![snapshot.line_item_id()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::LineItemNotFound {
                id: snapshot.line_item_id().to_string(),
            });
        }

        tx.execute(
            "INSERT INTO usage_snapshots (
                snapshot_id, line_item_id, formula_key, formula_sequence, inputs, outputs,
                line_total_output, computed_at, triggered_by, digest
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot.id(),
                snapshot.line_item_id(),
                snapshot.formula_key(),
                snapshot.formula_sequence(),
                serde_json::to_string(snapshot.inputs())?,
                serde_json::to_string(snapshot.outputs())?,
                snapshot.line_total_output(),
                timestamp(&snapshot.computed_at()),
                snapshot.triggered_by(),
                snapshot.digest(),
            ],
        )?;

        insert_event(&tx, &Event::snapshot_recorded(snapshot))?;
        tx.commit()?;
        Ok(())
    }

    fn latest_snapshot(&self, line_item_id: &str) -> Result<Option<UsageSnapshot>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM usage_snapshots WHERE line_item_id = ?1 ORDER BY id DESC LIMIT 1",
            SnapshotRow::COLUMNS
        );
        match conn
            .query_row(&sql, params![line_item_id], SnapshotRow::from_row)
            .optional()?
        {
            Some(row) => Ok(Some(row.into_snapshot()?)),
            None => Ok(None),
        }
    }

    fn snapshot_history(&self, line_item_id: &str) -> Result<Vec<UsageSnapshot>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM usage_snapshots WHERE line_item_id = ?1 ORDER BY id ASC",
            SnapshotRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![line_item_id], SnapshotRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    fn set_organization_pricing(&self, organization_id: &str, policy: &PricingPolicy) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO organization_pricing (organization_id, policy, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(organization_id) DO UPDATE SET
                policy = excluded.policy,
                updated_at = excluded.updated_at",
            params![
                organization_id,
                serde_json::to_string(policy)?,
                timestamp(&Utc::now()),
            ],
        )?;
        insert_event(&tx, &Event::pricing_updated(organization_id, policy)?)?;
        tx.commit()?;
        Ok(())
    }

    fn events(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        self.events_for(entity_type, entity_id)
    }

    fn organization_pricing(&self, organization_id: &str) -> Result<Option<PricingPolicy>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT policy FROM organization_pricing WHERE organization_id = ?1",
                params![organization_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_json("organization_pricing", &raw)?)),
            None => Ok(None),
        }
    }
}
