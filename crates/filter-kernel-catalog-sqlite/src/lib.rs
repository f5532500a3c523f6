use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use filter_kernel_core::vocabulary::split_list;
use filter_kernel_core::{
    columns, CanonicalVocabulary, CatalogError, CatalogRequest, CatalogSource, ParamStyle,
    ProductRecord, QueryParam, RawRow, RenderedQuery,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 3;

/// SQLite VM instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

const PRODUCTS_TABLE: &str = "catalog_products";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS catalog_products (
  unique_id TEXT PRIMARY KEY,
  product_name TEXT NOT NULL,
  variant_name TEXT,
  variant_price REAL CHECK (variant_price IS NULL OR variant_price >= 0),
  description_clean TEXT,
  colors_raw TEXT,
  has_red INTEGER NOT NULL CHECK (has_red IN (0, 1)),
  has_pink INTEGER NOT NULL CHECK (has_pink IN (0, 1)),
  has_white INTEGER NOT NULL CHECK (has_white IN (0, 1)),
  has_yellow INTEGER NOT NULL CHECK (has_yellow IN (0, 1)),
  has_orange INTEGER NOT NULL CHECK (has_orange IN (0, 1)),
  has_purple INTEGER NOT NULL CHECK (has_purple IN (0, 1)),
  has_blue INTEGER NOT NULL CHECK (has_blue IN (0, 1)),
  has_green INTEGER NOT NULL CHECK (has_green IN (0, 1)),
  season_start_month INTEGER,
  season_start_day INTEGER,
  season_end_month INTEGER,
  season_end_day INTEGER,
  season_range_2_start_month INTEGER,
  season_range_2_start_day INTEGER,
  season_range_2_end_month INTEGER,
  season_range_2_end_day INTEGER,
  season_range_3_start_month INTEGER,
  season_range_3_start_day INTEGER,
  season_range_3_end_month INTEGER,
  season_range_3_end_day INTEGER,
  is_year_round INTEGER CHECK (is_year_round IS NULL OR is_year_round IN (0, 1)),
  diy_level TEXT,
  holiday_occasion TEXT,
  product_type_all_flowers TEXT,
  group_category TEXT
);

CREATE INDEX IF NOT EXISTS idx_catalog_products_name ON catalog_products(product_name);
CREATE INDEX IF NOT EXISTS idx_catalog_products_price ON catalog_products(variant_price);
";

const MIGRATION_002_SQL: &str = r"
CREATE VIEW IF NOT EXISTS flowers AS SELECT * FROM catalog_products;
";

const MIGRATION_003_SQL: &str = r"
ALTER TABLE catalog_products ADD COLUMN recipe_metafield TEXT;
DROP VIEW IF EXISTS flowers;
CREATE VIEW flowers AS SELECT * FROM catalog_products;
";

/// How a product is laid out in the catalog table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowShape {
    /// One row per product carrying every bucket flag.
    PerProduct,
    /// One row per color bucket, keyed `<key>::<bucket>`.
    PerColorVariant,
}

pub struct SqliteCatalog {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub rows_written: usize,
    /// Raw color names with no canonical bucket; they set no flag.
    pub unmapped_colors: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub product_rows: i64,
    pub schema_status: SchemaStatus,
}

impl SqliteCatalog {
    /// Placeholder syntax of every query this catalog accepts.
    pub const PARAM_STYLE: ParamStyle = ParamStyle::Question;

    /// Open a SQLite-backed catalog and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }
        if version < 2 {
            self.conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&self.conn, 2)?;
            version = 2;
        }
        if version < 3 {
            self.conn.execute_batch(MIGRATION_003_SQL).context("failed to apply migration v3")?;
            record_schema_version(&self.conn, 3)?;
            version = 3;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Insert or replace one catalog row. Effort and occasion text is stored in its
    /// normalized match form; every other field is written as given.
    ///
    /// # Errors
    /// Returns an error when the row violates the catalog schema or cannot be written.
    pub fn insert_record(&mut self, record: &ProductRecord) -> Result<()> {
        insert_row(&self.conn, &record.with_match_text().to_row())
            .with_context(|| format!("failed to write catalog product {}", record.key))
    }

    /// Insert products, deriving bucket flags from `colors_raw` with `vocabulary` and storing
    /// effort and occasion text in normalized match form.
    ///
    /// # Errors
    /// Returns an error when the transaction or any row write fails; nothing is written then.
    pub fn load_products(
        &mut self,
        records: &[ProductRecord],
        vocabulary: &CanonicalVocabulary,
        shape: RowShape,
    ) -> Result<LoadSummary> {
        let tx = self.conn.transaction().context("failed to start catalog load transaction")?;
        let mut summary = LoadSummary::default();

        for record in records {
            let colors_raw = record.colors_raw.as_deref().unwrap_or_default();
            summary.unmapped_colors.extend(vocabulary.unmapped_colors(colors_raw));
            let buckets = vocabulary.buckets_in(colors_raw);

            let rows = match shape {
                RowShape::PerColorVariant if buckets.len() > 1 => buckets
                    .iter()
                    .map(|bucket| {
                        let mut variant = record.clone();
                        variant.key = format!("{}::{bucket}", record.key);
                        variant.color_flags = BTreeSet::from([*bucket]);
                        let names: Vec<&str> = split_list(colors_raw)
                            .filter(|name| vocabulary.bucket_for_color(name) == Some(*bucket))
                            .collect();
                        variant.colors_raw = Some(names.join("; "));
                        variant
                    })
                    .collect::<Vec<_>>(),
                _ => {
                    let mut product = record.clone();
                    product.color_flags = buckets;
                    vec![product]
                }
            };

            for row in &rows {
                insert_row(&tx, &row.with_match_text().to_row())
                    .with_context(|| format!("failed to write catalog product {}", row.key))?;
                summary.rows_written += 1;
            }
        }

        tx.commit().context("failed to commit catalog load transaction")?;
        if !summary.unmapped_colors.is_empty() {
            tracing::warn!(unmapped = ?summary.unmapped_colors, "catalog colors without a bucket");
        }
        Ok(summary)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_products(&self) -> Result<i64> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {PRODUCTS_TABLE}"), [], |row| row.get(0))
            .context("failed to count catalog products")
    }

    /// Run quick-check and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        let schema_status = self.schema_status()?;
        let product_rows =
            if schema_status.current_version >= 1 { self.count_products()? } else { 0 };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            product_rows,
            schema_status,
        })
    }

    fn query_rows(&self, query: &RenderedQuery) -> rusqlite::Result<Vec<RawRow>> {
        let mut stmt = self.conn.prepare(&query.sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let bound: Vec<SqlValue> = query.params.iter().map(param_value).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut raw = RawRow::new();
            for (index, name) in names.iter().enumerate() {
                raw.insert(name.clone(), json_value(row.get_ref(index)?));
            }
            out.push(raw);
        }
        Ok(out)
    }
}

impl CatalogSource for SqliteCatalog {
    fn param_style(&self) -> ParamStyle {
        Self::PARAM_STYLE
    }

    fn fetch(&self, request: &CatalogRequest<'_>) -> Result<Vec<RawRow>, CatalogError> {
        if request.query.style != Self::PARAM_STYLE {
            return Err(CatalogError::Backend(
                "sqlite catalog requires question-style placeholders".to_string(),
            ));
        }

        let started = Instant::now();
        let deadline = started + request.timeout;
        self.conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        let result = self.query_rows(request.query);
        self.conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|err| {
            if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                CatalogError::TimedOut { elapsed_ms }
            } else {
                CatalogError::Backend(err.to_string())
            }
        })
    }
}

fn insert_row(conn: &Connection, row: &RawRow) -> Result<()> {
    let names = columns::select_list();
    let placeholders: Vec<String> = (1..=names.len()).map(|index| format!("?{index}")).collect();
    let values: Vec<SqlValue> =
        names.iter().map(|name| row.get(*name).map_or(SqlValue::Null, sql_value)).collect();
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {PRODUCTS_TABLE} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        ),
        rusqlite::params_from_iter(values.iter()),
    )?;
    Ok(())
}

fn param_value(param: &QueryParam) -> SqlValue {
    match param {
        QueryParam::Int(value) => SqlValue::Integer(*value),
        QueryParam::Float(value) => SqlValue::Real(*value),
        QueryParam::Text(value) => SqlValue::Text(value.clone()),
    }
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => number.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => {
            serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number)
        }
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format migration timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
