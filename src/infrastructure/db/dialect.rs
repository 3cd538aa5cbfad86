use anyhow::Result;
use serde_json::{json, Value};
use sqlx::any::AnyRow;
use sqlx::{Column, Row, TypeInfo};

use crate::domain::error::{SyncError, SyncResult};
use crate::domain::schema::charset_of;

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// SQL dialect: metadata queries, statement fragments and DDL per driver.
///
/// Everything here is string building. Values never pass through it; they
/// are bound as parameters by the session, so only identifiers, declared
/// types and collations (all validated upstream) end up in SQL text.
pub trait QueryDialect: Send + Sync {
    /// Driver name ("postgres", "mysql", …), for logs.
    fn name(&self) -> &'static str;

    /// `true` when rows are read through a typed SELECT built from the
    /// declared column types. SQLite reads `SELECT *` and relies on the
    /// runtime type names instead.
    fn needs_introspection(&self) -> bool {
        true
    }

    /// Quote an identifier (table, column).
    /// - MySQL / MariaDB → backtick: `` `col` ``
    /// - PostgreSQL / SQLite → double-quote: `"col"`
    fn quote_ident(&self, s: &str) -> String;

    /// Cast expression that turns a column `sqlx::AnyRow` cannot decode
    /// natively into a string.
    fn cast_to_text(&self, col_quoted: &str) -> String;

    /// `true` if `base_type` is decodable by `sqlx::AnyRow` without a cast.
    fn is_native_type(&self, base_type: &str) -> bool;

    /// Placeholder for the `n`-th (1-based) bound parameter.
    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    /// Parameter expression for a value written into a column declared as
    /// `declared_type`.
    fn param(&self, n: usize, _declared_type: &str) -> String {
        self.placeholder(n)
    }

    /// Base tables of the connected database. No parameters.
    fn list_tables_sql(&self) -> &'static str;

    /// `(name, declared type, collation)` per column in ordinal order.
    /// One parameter: the table name.
    fn columns_sql(&self) -> &'static str;

    /// Primary-key column names. One parameter: the table name.
    fn primary_key_sql(&self) -> &'static str;

    /// Table-level collation. One parameter: the table name.
    fn table_collation_sql(&self) -> Option<&'static str> {
        None
    }

    fn count_sql(&self, table_q: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", table_q)
    }

    /// Engine-side whole-table checksum, if the engine has one.
    fn checksum_sql(&self, _table_q: &str) -> Option<String> {
        None
    }

    /// Tail of an `INSERT` turning it into an upsert on `pk_q`. `updates`
    /// are the quoted non-key columns.
    fn upsert_clause(&self, pk_q: &str, updates: &[String]) -> String;

    fn add_column_sql(&self, table_q: &str, col_q: &str, declared_type: &str) -> SyncResult<String> {
        Ok(format!("ALTER TABLE {} ADD COLUMN {} {}", table_q, col_q, declared_type)
            .trim_end()
            .to_string())
    }

    fn modify_column_sql(&self, table_q: &str, col_q: &str, declared_type: &str)
        -> SyncResult<String>;

    fn modify_collation_sql(
        &self,
        table_q: &str,
        col_q: &str,
        declared_type: &str,
        collation: &str,
    ) -> SyncResult<String>;

    fn convert_collation_sql(&self, _table_q: &str, _collation: &str) -> SyncResult<String> {
        Err(SyncError::Unsupported("table collation conversion".to_string()))
    }

    /// `true` for lock-wait timeouts, deadlocks and busy errors.
    fn is_contention(&self, code: Option<&str>, message: &str) -> bool;

    /// `true` when any failed statement leaves the transaction unusable
    /// until it is rolled back (PostgreSQL).
    fn error_aborts_transaction(&self) -> bool {
        false
    }

    /// `true` when the server itself rolled back the whole transaction
    /// (InnoDB deadlock victim).
    fn rolled_back_transaction(&self, _code: Option<&str>, _message: &str) -> bool {
        false
    }
}

/// Row decoder: read a single `AnyRow` column into a `serde_json::Value`.
///
/// Implemented per driver. Lives in infrastructure only — callers outside
/// this module receive `Value`s, never raw `AnyRow`s.
pub trait RowDecoder: Send + Sync {
    /// Decode the column at `idx` using `type_hint` (a base type such as
    /// `int` or `decimal`) to reconstruct the correct `Value` variant.
    fn decode_column(&self, row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value>;
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ─────────────────────────────────────────────────────────────────────────────

pub struct PostgresDialect;

impl QueryDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("\"{}\"", s.replace('"', "\"\""))
    }

    fn cast_to_text(&self, col_quoted: &str) -> String {
        format!("{}::TEXT AS {}", col_quoted, col_quoted)
    }

    fn is_native_type(&self, base_type: &str) -> bool {
        matches!(
            base_type.to_lowercase().as_str(),
            "boolean" | "smallint" | "integer" | "bigint" | "real" | "double precision"
        )
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${}", n)
    }

    // Parameters arrive untyped from the Any driver; casting to the column
    // type lets text bind into timestamp, numeric, jsonb, …
    fn param(&self, n: usize, declared_type: &str) -> String {
        if declared_type.is_empty() {
            self.placeholder(n)
        } else {
            format!("CAST(${} AS {})", n, declared_type)
        }
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT tablename::TEXT FROM pg_catalog.pg_tables \
         WHERE schemaname = current_schema() \
         ORDER BY tablename"
    }

    fn columns_sql(&self) -> &'static str {
        "SELECT a.attname::TEXT, format_type(a.atttypid, a.atttypmod)::TEXT, \
                CASE WHEN a.attcollation <> 0 AND a.attcollation <> t.typcollation \
                     THEN co.collname::TEXT END \
         FROM pg_attribute a \
         JOIN pg_type t ON t.oid = a.atttypid \
         LEFT JOIN pg_collation co ON co.oid = a.attcollation \
         WHERE a.attrelid = quote_ident($1)::regclass \
           AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY a.attnum"
    }

    fn primary_key_sql(&self) -> &'static str {
        "SELECT a.attname::TEXT \
         FROM pg_index i \
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
         WHERE i.indrelid = quote_ident($1)::regclass AND i.indisprimary"
    }

    fn checksum_sql(&self, table_q: &str) -> Option<String> {
        Some(format!(
            "SELECT md5(COALESCE(string_agg(t::TEXT, E'\\n' ORDER BY t::TEXT), '')) FROM {} AS t",
            table_q
        ))
    }

    fn upsert_clause(&self, pk_q: &str, updates: &[String]) -> String {
        if updates.is_empty() {
            return format!("ON CONFLICT ({}) DO NOTHING", pk_q);
        }
        let sets: Vec<String> = updates
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", c, c))
            .collect();
        format!("ON CONFLICT ({}) DO UPDATE SET {}", pk_q, sets.join(", "))
    }

    fn modify_column_sql(&self, table_q: &str, col_q: &str, declared_type: &str)
        -> SyncResult<String> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            table_q, col_q, declared_type
        ))
    }

    fn modify_collation_sql(
        &self,
        table_q: &str,
        col_q: &str,
        declared_type: &str,
        collation: &str,
    ) -> SyncResult<String> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} COLLATE {}",
            table_q,
            col_q,
            declared_type,
            self.quote_ident(collation)
        ))
    }

    fn is_contention(&self, code: Option<&str>, message: &str) -> bool {
        matches!(code, Some("55P03" | "40P01" | "40001"))
            || message.contains("could not obtain lock")
            || message.contains("deadlock detected")
    }

    fn error_aborts_transaction(&self) -> bool {
        true
    }
}

impl RowDecoder for PostgresDialect {
    fn decode_column(&self, row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value> {
        col_to_json(row, idx, type_hint)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MySQL / MariaDB
// ─────────────────────────────────────────────────────────────────────────────

pub struct MysqlDialect;

impl QueryDialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("`{}`", s.replace('`', "``"))
    }

    fn cast_to_text(&self, col_quoted: &str) -> String {
        // Comes back as BLOB through AnyRow; the decoder reads bytes.
        format!("CONVERT({} USING utf8mb4) AS {}", col_quoted, col_quoted)
    }

    fn is_native_type(&self, base_type: &str) -> bool {
        matches!(
            base_type.to_lowercase().as_str(),
            "int" | "mediumint" | "bigint" | "float" | "double"
        )
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
         ORDER BY table_name"
    }

    fn columns_sql(&self) -> &'static str {
        "SELECT column_name, column_type, collation_name \
         FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? \
         ORDER BY ordinal_position"
    }

    fn primary_key_sql(&self) -> &'static str {
        "SELECT k.column_name \
         FROM information_schema.table_constraints c \
         JOIN information_schema.key_column_usage k \
           ON k.constraint_schema = c.constraint_schema \
          AND k.table_name = c.table_name \
          AND k.constraint_name = c.constraint_name \
         WHERE c.constraint_type = 'PRIMARY KEY' \
           AND c.table_schema = DATABASE() AND c.table_name = ? \
         ORDER BY k.ordinal_position"
    }

    fn table_collation_sql(&self) -> Option<&'static str> {
        Some(
            "SELECT table_collation FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
    }

    fn checksum_sql(&self, table_q: &str) -> Option<String> {
        Some(format!("CHECKSUM TABLE {}", table_q))
    }

    fn upsert_clause(&self, pk_q: &str, updates: &[String]) -> String {
        if updates.is_empty() {
            return format!("ON DUPLICATE KEY UPDATE {} = {}", pk_q, pk_q);
        }
        let sets: Vec<String> = updates
            .iter()
            .map(|c| format!("{} = VALUES({})", c, c))
            .collect();
        format!("ON DUPLICATE KEY UPDATE {}", sets.join(", "))
    }

    fn modify_column_sql(&self, table_q: &str, col_q: &str, declared_type: &str)
        -> SyncResult<String> {
        Ok(format!(
            "ALTER TABLE {} MODIFY COLUMN {} {}",
            table_q, col_q, declared_type
        ))
    }

    fn modify_collation_sql(
        &self,
        table_q: &str,
        col_q: &str,
        declared_type: &str,
        collation: &str,
    ) -> SyncResult<String> {
        Ok(format!(
            "ALTER TABLE {} MODIFY COLUMN {} {} COLLATE {}",
            table_q, col_q, declared_type, collation
        ))
    }

    fn convert_collation_sql(&self, table_q: &str, collation: &str) -> SyncResult<String> {
        Ok(format!(
            "ALTER TABLE {} CONVERT TO CHARACTER SET {} COLLATE {}",
            table_q,
            charset_of(collation),
            collation
        ))
    }

    fn is_contention(&self, code: Option<&str>, message: &str) -> bool {
        code == Some("40001")
            || message.contains("Lock wait timeout exceeded")
            || message.contains("Deadlock found")
    }

    // Error 1213 (SQLSTATE 40001). A lock wait timeout (1205) only undoes
    // the statement.
    fn rolled_back_transaction(&self, code: Option<&str>, message: &str) -> bool {
        code == Some("40001") || message.contains("Deadlock found")
    }
}

impl RowDecoder for MysqlDialect {
    fn decode_column(&self, row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value> {
        // MySQL returns non-native columns as BLOB regardless of any SQL cast.
        let anyrow_type = row.column(idx).type_info().name();
        if anyrow_type == "BLOB" {
            blob_to_json(row, idx, type_hint)
        } else {
            col_to_json(row, idx, type_hint)
        }
    }
}

// MariaDB shares MySQL's wire protocol, catalog and DDL.
pub struct MariadbDialect;

impl QueryDialect for MariadbDialect {
    fn name(&self) -> &'static str {
        "mariadb"
    }

    fn quote_ident(&self, s: &str) -> String {
        MysqlDialect.quote_ident(s)
    }

    fn cast_to_text(&self, col_quoted: &str) -> String {
        MysqlDialect.cast_to_text(col_quoted)
    }

    fn is_native_type(&self, base_type: &str) -> bool {
        MysqlDialect.is_native_type(base_type)
    }

    fn list_tables_sql(&self) -> &'static str {
        MysqlDialect.list_tables_sql()
    }

    fn columns_sql(&self) -> &'static str {
        MysqlDialect.columns_sql()
    }

    fn primary_key_sql(&self) -> &'static str {
        MysqlDialect.primary_key_sql()
    }

    fn table_collation_sql(&self) -> Option<&'static str> {
        MysqlDialect.table_collation_sql()
    }

    fn checksum_sql(&self, table_q: &str) -> Option<String> {
        MysqlDialect.checksum_sql(table_q)
    }

    fn upsert_clause(&self, pk_q: &str, updates: &[String]) -> String {
        MysqlDialect.upsert_clause(pk_q, updates)
    }

    fn modify_column_sql(&self, table_q: &str, col_q: &str, declared_type: &str)
        -> SyncResult<String> {
        MysqlDialect.modify_column_sql(table_q, col_q, declared_type)
    }

    fn modify_collation_sql(
        &self,
        table_q: &str,
        col_q: &str,
        declared_type: &str,
        collation: &str,
    ) -> SyncResult<String> {
        MysqlDialect.modify_collation_sql(table_q, col_q, declared_type, collation)
    }

    fn convert_collation_sql(&self, table_q: &str, collation: &str) -> SyncResult<String> {
        MysqlDialect.convert_collation_sql(table_q, collation)
    }

    fn is_contention(&self, code: Option<&str>, message: &str) -> bool {
        MysqlDialect.is_contention(code, message)
    }

    fn rolled_back_transaction(&self, code: Option<&str>, message: &str) -> bool {
        MysqlDialect.rolled_back_transaction(code, message)
    }
}

impl RowDecoder for MariadbDialect {
    fn decode_column(&self, row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value> {
        MysqlDialect.decode_column(row, idx, type_hint)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteDialect;

impl QueryDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn needs_introspection(&self) -> bool {
        false
    }

    fn quote_ident(&self, s: &str) -> String {
        format!("\"{}\"", s.replace('"', "\"\""))
    }

    fn cast_to_text(&self, col_quoted: &str) -> String {
        format!("CAST({} AS TEXT) AS {}", col_quoted, col_quoted)
    }

    fn is_native_type(&self, base_type: &str) -> bool {
        // Type affinity: every storage class decodes natively.
        matches!(
            base_type.to_uppercase().as_str(),
            "INTEGER" | "INT" | "REAL" | "NUMERIC" | "TEXT" | "BLOB"
        )
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
    }

    fn columns_sql(&self) -> &'static str {
        "SELECT name, type, NULL FROM pragma_table_info(?) ORDER BY cid"
    }

    fn primary_key_sql(&self) -> &'static str {
        "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk"
    }

    fn upsert_clause(&self, pk_q: &str, updates: &[String]) -> String {
        if updates.is_empty() {
            return format!("ON CONFLICT ({}) DO NOTHING", pk_q);
        }
        let sets: Vec<String> = updates
            .iter()
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect();
        format!("ON CONFLICT ({}) DO UPDATE SET {}", pk_q, sets.join(", "))
    }

    fn modify_column_sql(&self, _table_q: &str, _col_q: &str, _declared_type: &str)
        -> SyncResult<String> {
        Err(SyncError::Unsupported("MODIFY COLUMN".to_string()))
    }

    fn modify_collation_sql(
        &self,
        _table_q: &str,
        _col_q: &str,
        _declared_type: &str,
        _collation: &str,
    ) -> SyncResult<String> {
        Err(SyncError::Unsupported("column collation change".to_string()))
    }

    fn is_contention(&self, _code: Option<&str>, message: &str) -> bool {
        message.contains("database is locked")
            || message.contains("database table is locked")
            || message.contains("busy")
    }
}

impl RowDecoder for SqliteDialect {
    fn decode_column(&self, row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value> {
        col_to_json(row, idx, type_hint)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve the dialect for a configured driver name. Unknown names fall back
/// to MySQL, the default driver.
pub fn from_driver(driver: &str) -> Box<dyn Dialect> {
    match driver {
        "postgres" => Box::new(PostgresDialect),
        "mariadb" => Box::new(MariadbDialect),
        "sqlite" => Box::new(SqliteDialect),
        _ => Box::new(MysqlDialect),
    }
}

/// Combined supertrait — convenience alias so callers only store one object.
pub trait Dialect: QueryDialect + RowDecoder {}
impl Dialect for PostgresDialect {}
impl Dialect for MysqlDialect {}
impl Dialect for MariadbDialect {}
impl Dialect for SqliteDialect {}

// ─────────────────────────────────────────────────────────────────────────────
// Shared decoding helpers (private to this module)
// ─────────────────────────────────────────────────────────────────────────────

fn parse_number(s: String) -> Value {
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::String(s))
}

/// Decode a BLOB column (MySQL/MariaDB non-native types) as raw UTF-8 bytes,
/// then reinterpret the string using the type hint.
fn blob_to_json(row: &AnyRow, idx: usize, type_hint: &str) -> Result<Value> {
    let bytes: Option<Vec<u8>> = row.try_get(idx)?;
    let Some(b) = bytes else {
        return Ok(Value::Null);
    };
    let s = String::from_utf8_lossy(&b).into_owned();
    Ok(match type_hint.to_uppercase().as_str() {
        "DECIMAL" | "NUMERIC" => parse_number(s),
        "TINYINT" | "SMALLINT" => s
            .parse::<i64>()
            .map(|v| json!(v))
            .unwrap_or(Value::String(s)),
        "JSON" => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        _ => Value::String(s),
    })
}

/// Decode a column whose AnyRow type is supported natively or has been
/// cast to TEXT in the SELECT query.
fn col_to_json(row: &AnyRow, idx: usize, type_name: &str) -> Result<Value> {
    let v = match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(idx)?
            .map_or(Value::Null, Value::Bool),

        "INT2" | "SMALLINT" | "INT4" | "INT" | "INTEGER" | "SERIAL" => row
            .try_get::<Option<i32>, _>(idx)?
            .map_or(Value::Null, |v| json!(v)),

        "INT8" | "BIGINT" | "BIGSERIAL" => row
            .try_get::<Option<i64>, _>(idx)?
            .map_or(Value::Null, |v| json!(v)),

        "FLOAT4" | "REAL" | "FLOAT" => row
            .try_get::<Option<f32>, _>(idx)?
            .map_or(Value::Null, |v| json!(v as f64)),

        "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(idx)?
            .map_or(Value::Null, |v| json!(v)),

        // Cast to TEXT in the SELECT, parsed back here.
        "NUMERIC" | "DECIMAL" => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Value::Null, parse_number),

        "JSON" | "JSONB" => match row.try_get::<Option<String>, _>(idx)? {
            None => Value::Null,
            Some(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        },

        // TEXT, VARCHAR, CHAR, UUID, DATETIME, TIMESTAMP, DATE …
        _ => row
            .try_get::<Option<String>, _>(idx)?
            .map_or(Value::Null, Value::String),
    };
    Ok(v)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(PostgresDialect.quote_ident(r#"ta"ble"#), r#""ta""ble""#);
        assert_eq!(MysqlDialect.quote_ident("ta`ble"), "`ta``ble`");
        assert_eq!(SqliteDialect.quote_ident("t"), r#""t""#);
    }

    #[test]
    fn placeholders_per_driver() {
        assert_eq!(MysqlDialect.param(3, "int"), "?");
        assert_eq!(SqliteDialect.param(1, "TEXT"), "?");
        assert_eq!(PostgresDialect.param(2, "numeric(10,2)"), "CAST($2 AS numeric(10,2))");
        assert_eq!(PostgresDialect.param(2, ""), "$2");
    }

    #[test]
    fn mysql_upsert_uses_values() {
        let clause = MysqlDialect.upsert_clause("`id`", &["`name`".into(), "`qty`".into()]);
        assert_eq!(
            clause,
            "ON DUPLICATE KEY UPDATE `name` = VALUES(`name`), `qty` = VALUES(`qty`)"
        );
        assert_eq!(
            MysqlDialect.upsert_clause("`id`", &[]),
            "ON DUPLICATE KEY UPDATE `id` = `id`"
        );
    }

    #[test]
    fn postgres_and_sqlite_upsert_use_on_conflict() {
        assert_eq!(
            PostgresDialect.upsert_clause(r#""id""#, &[r#""v""#.into()]),
            r#"ON CONFLICT ("id") DO UPDATE SET "v" = EXCLUDED."v""#
        );
        assert_eq!(
            SqliteDialect.upsert_clause(r#""id""#, &[]),
            r#"ON CONFLICT ("id") DO NOTHING"#
        );
    }

    #[test]
    fn mysql_ddl() {
        let d = MysqlDialect;
        assert_eq!(
            d.add_column_sql("`t`", "`amount`", "decimal(10,2)").unwrap(),
            "ALTER TABLE `t` ADD COLUMN `amount` decimal(10,2)"
        );
        assert_eq!(
            d.modify_collation_sql("`t`", "`name`", "varchar(255)", "utf8mb4_bin")
                .unwrap(),
            "ALTER TABLE `t` MODIFY COLUMN `name` varchar(255) COLLATE utf8mb4_bin"
        );
        assert_eq!(
            d.convert_collation_sql("`t`", "utf8mb4_unicode_ci").unwrap(),
            "ALTER TABLE `t` CONVERT TO CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
        );
    }

    #[test]
    fn sqlite_cannot_modify_columns() {
        let err = SqliteDialect.modify_column_sql("\"t\"", "\"c\"", "TEXT").unwrap_err();
        assert!(matches!(err, SyncError::Unsupported(_)));
        assert!(SqliteDialect.convert_collation_sql("\"t\"", "NOCASE").is_err());
    }

    #[test]
    fn postgres_collation_is_quoted() {
        let sql = PostgresDialect
            .modify_collation_sql(r#""t""#, r#""c""#, "text", "en_US.utf8")
            .unwrap();
        assert!(sql.ends_with(r#"COLLATE "en_US.utf8""#), "{}", sql);
    }

    #[test]
    fn contention_classification() {
        assert!(MysqlDialect.is_contention(
            Some("HY000"),
            "Lock wait timeout exceeded; try restarting transaction"
        ));
        assert!(MysqlDialect.is_contention(Some("40001"), "Deadlock found"));
        assert!(!MysqlDialect.is_contention(Some("42S02"), "Table 'x' doesn't exist"));
        assert!(PostgresDialect.is_contention(Some("55P03"), "lock not available"));
        assert!(!PostgresDialect.is_contention(Some("23505"), "duplicate key"));
        assert!(SqliteDialect.is_contention(None, "database is locked"));
    }

    #[test]
    fn only_innodb_deadlocks_lose_the_transaction() {
        assert!(MysqlDialect.rolled_back_transaction(Some("40001"), "Deadlock found when trying to get lock"));
        assert!(MariadbDialect.rolled_back_transaction(Some("40001"), "Deadlock found"));
        assert!(!MysqlDialect.rolled_back_transaction(Some("HY000"), "Lock wait timeout exceeded"));
        assert!(!PostgresDialect.rolled_back_transaction(Some("40P01"), "deadlock detected"));
        assert!(PostgresDialect.error_aborts_transaction());
        assert!(!MysqlDialect.error_aborts_transaction());
        assert!(!SqliteDialect.error_aborts_transaction());
    }

    #[test]
    fn checksum_only_where_the_engine_has_one() {
        assert_eq!(
            MysqlDialect.checksum_sql("`t`").as_deref(),
            Some("CHECKSUM TABLE `t`")
        );
        assert!(PostgresDialect.checksum_sql(r#""t""#).is_some());
        assert!(SqliteDialect.checksum_sql(r#""t""#).is_none());
    }

    #[test]
    fn native_types() {
        assert!(PostgresDialect.is_native_type("integer"));
        assert!(!PostgresDialect.is_native_type("numeric"));
        assert!(MysqlDialect.is_native_type("int"));
        assert!(!MysqlDialect.is_native_type("tinyint"));
        assert!(!MysqlDialect.is_native_type("datetime"));
    }

    #[test]
    fn from_driver_names() {
        assert_eq!(from_driver("postgres").name(), "postgres");
        assert_eq!(from_driver("mariadb").name(), "mariadb");
        assert_eq!(from_driver("sqlite").name(), "sqlite");
        assert_eq!(from_driver("unknown").name(), "mysql");
    }
}
