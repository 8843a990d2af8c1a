//! Relational store
//!
//! Entities flow to the database as `Record`s applied through a `Store`.
//! Each table is described once by an `EntityDef` (columns, natural key,
//! conflict behavior) and the store turns that into idempotent upserts.
//! `PgStore` runs one transaction per phase so a failure inside a phase
//! leaves no partial effects; the in-memory store mirrors the same
//! conflict semantics for pipeline tests.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================
// Records and entity definitions
// ============================================================

/// A typed, nullable bind value. Carrying the SQL type explicitly keeps
/// null binds unambiguous across text, numeric, date and id columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Text(Option<String>),
    Num(Option<f64>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    Id(Uuid),
}

impl Bind {
    pub fn text(s: &str) -> Bind {
        if s.is_empty() {
            Bind::Text(None)
        } else {
            Bind::Text(Some(s.to_string()))
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Bind::Text(None) | Bind::Num(None) | Bind::Date(None) | Bind::Timestamp(None)
        )
    }

    /// Textual form used for natural-key comparison; null normalizes to
    /// the empty string, matching the coalesce() conflict targets.
    fn key_text(&self) -> String {
        match self {
            Bind::Text(v) => v.clone().unwrap_or_default(),
            Bind::Num(v) => v.map(|n| n.to_string()).unwrap_or_default(),
            Bind::Date(v) => v.map(|d| d.to_string()).unwrap_or_default(),
            Bind::Timestamp(v) => v.map(|t| t.to_string()).unwrap_or_default(),
            Bind::Id(u) => u.to_string(),
        }
    }
}

/// One row destined for an entity table. `binds` is ordered to match the
/// owning `EntityDef::columns`.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: Uuid,
    pub binds: Vec<Bind>,
}

impl Record {
    pub fn new(binds: Vec<Bind>) -> Record {
        Record { id: Uuid::new_v4(), binds }
    }
}

/// Natural key used to resolve references after a dimension phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Code(String),
    Composite(String, NaiveDate),
}

#[derive(Debug, Clone)]
pub enum KeyKind {
    Code(&'static str),
    Composite(&'static str, &'static str),
}

#[derive(Debug, Clone)]
pub enum ConflictAction {
    /// DO UPDATE on the listed columns.
    Update(Vec<&'static str>),
    /// DO NOTHING: insert-once rows.
    Nothing,
}

/// Alternate-code claim rule: the guarded column is nulled when another
/// row (different owner column value) already holds the same code, so a
/// code can never belong to two owners and re-runs stay idempotent.
#[derive(Debug, Clone)]
pub struct ClaimGuard {
    pub column: &'static str,
    pub owner_column: &'static str,
}

#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: &'static str,
    /// Schema-qualified table name.
    pub table: String,
    pub id_column: &'static str,
    /// Data columns in record bind order.
    pub columns: Vec<&'static str>,
    pub key: KeyKind,
    /// Columns compared for conflict detection (in-memory store).
    pub conflict_cols: Vec<&'static str>,
    /// SQL conflict target, including parentheses.
    pub conflict_target: String,
    pub action: ConflictAction,
    pub claim_guard: Option<ClaimGuard>,
    /// Columns declared NOT NULL in the schema; the in-memory store
    /// rejects null binds here the way Postgres would.
    pub not_null: Vec<&'static str>,
}

impl EntityDef {
    fn column_index(&self, name: &str) -> usize {
        self.columns
            .iter()
            .position(|c| *c == name)
            .unwrap_or_else(|| panic!("entity '{}' has no column '{}'", self.name, name))
    }
}

// ============================================================
// Store trait
// ============================================================

pub trait Store {
    /// Apply one phase of records atomically. Returns the number of rows
    /// inserted or updated (conflicts under DO NOTHING count as zero).
    async fn apply_phase(&mut self, def: &EntityDef, records: &[Record]) -> Result<usize>;

    /// Natural key -> id map for reference resolution, read back after
    /// the entity's phase has been applied.
    async fn key_map(&mut self, def: &EntityDef) -> Result<HashMap<Key, Uuid>>;
}

// ============================================================
// Postgres store
// ============================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> PgStore {
        PgStore { pool }
    }
}

impl Store for PgStore {
    async fn apply_phase(&mut self, def: &EntityDef, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = upsert_sql(def);
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("Failed to begin transaction for {}", def.name))?;
        let mut applied = 0usize;
        for record in records {
            let mut query = sqlx::query(&sql).bind(record.id);
            for bind in &record.binds {
                query = bind_value(query, bind);
            }
            let result = query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Upsert into {} failed", def.table))?;
            applied += result.rows_affected() as usize;
        }
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit {} phase", def.name))?;
        Ok(applied)
    }

    async fn key_map(&mut self, def: &EntityDef) -> Result<HashMap<Key, Uuid>> {
        let mut map = HashMap::new();
        match def.key {
            KeyKind::Code(col) => {
                let sql = format!("SELECT {}, {} FROM {}", col, def.id_column, def.table);
                let rows = sqlx::query(&sql)
                    .fetch_all(&self.pool)
                    .await
                    .with_context(|| format!("Failed to read {} keys", def.name))?;
                for row in rows {
                    let code: String = row.get(0);
                    let id: Uuid = row.get(1);
                    map.insert(Key::Code(code), id);
                }
            }
            KeyKind::Composite(c1, c2) => {
                let sql = format!(
                    "SELECT {}, {}, {} FROM {}",
                    c1, c2, def.id_column, def.table
                );
                let rows = sqlx::query(&sql)
                    .fetch_all(&self.pool)
                    .await
                    .with_context(|| format!("Failed to read {} keys", def.name))?;
                for row in rows {
                    let code: String = row.get(0);
                    let date: NaiveDate = row.get(1);
                    let id: Uuid = row.get(2);
                    map.insert(Key::Composite(code, date), id);
                }
            }
        }
        Ok(map)
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, bind: &Bind) -> PgQuery<'q> {
    match bind {
        Bind::Text(v) => query.bind(v.clone()),
        Bind::Num(v) => query.bind(*v),
        Bind::Date(v) => query.bind(*v),
        Bind::Timestamp(v) => query.bind(*v),
        Bind::Id(u) => query.bind(*u),
    }
}

/// Build the single-statement upsert for an entity. The claim guard is
/// folded into the VALUES list as a CASE over an EXISTS probe, so claim
/// resolution and the upsert commit or roll back together.
fn upsert_sql(def: &EntityDef) -> String {
    let mut cols: Vec<String> = vec![def.id_column.to_string()];
    cols.extend(def.columns.iter().map(|c| c.to_string()));

    let mut placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("${}", i)).collect();
    if let Some(guard) = &def.claim_guard {
        // record binds start at $2
        let g = def.column_index(guard.column) + 2;
        let owner = def.column_index(guard.owner_column) + 2;
        placeholders[def.column_index(guard.column) + 1] = format!(
            "CASE WHEN ${g}::text IS NULL THEN NULL \
             WHEN EXISTS (SELECT 1 FROM {table} t \
             WHERE t.{gcol} = ${g} AND t.{owner_col} <> ${owner}) THEN NULL \
             ELSE ${g} END",
            g = g,
            owner = owner,
            table = def.table,
            gcol = guard.column,
            owner_col = guard.owner_column,
        );
    }

    let conflict = match &def.action {
        ConflictAction::Update(set_cols) => {
            let sets: Vec<String> = set_cols
                .iter()
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect();
            format!("DO UPDATE SET {}", sets.join(", "))
        }
        ConflictAction::Nothing => "DO NOTHING".to_string(),
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT {} {}",
        def.table,
        cols.join(", "),
        placeholders.join(", "),
        def.conflict_target,
        conflict
    )
}

// ============================================================
// In-memory store (tests)
// ============================================================


// ============================================================
// Tests
// ============================================================
