use crate::domain::error::{SyncError, SyncResult};
use crate::domain::schema::{SchemaChange, TableStructure};
use crate::domain::statement::{Binding, SqlValue, Statement};
use crate::domain::value_objects::{ColumnName, TableName};
use crate::infrastructure::db::dialect::QueryDialect;

/// Longest identifier accepted (MySQL allows 64, PostgreSQL 63).
const MAX_IDENT_LEN: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Accept a table or column name made of letters, digits, `_`, `$`, `-` and
/// spaces. Names are still quoted when rendered.
pub fn validate_ident(name: &str) -> SyncResult<&str> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IDENT_LEN
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '-' | ' '));
    if ok {
        Ok(name)
    } else {
        Err(SyncError::InvalidIdentifier(name.to_string()))
    }
}

/// Accept a declared column type such as `decimal(10,2) unsigned`,
/// `character varying(20)` or `enum('a','b')`.
///
/// Statement separators and comment markers are rejected and quotes must be
/// balanced. May be empty (SQLite columns without a type).
pub fn validate_declared_type(ty: &str) -> SyncResult<&str> {
    let ok = ty.len() <= 256
        && ty.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '.' | '\'' | '[' | ']')
        })
        && !ty.contains("--")
        && ty.matches('\'').count() % 2 == 0;
    if ok {
        Ok(ty)
    } else {
        Err(SyncError::InvalidIdentifier(ty.to_string()))
    }
}

/// Accept a collation name: `utf8mb4_unicode_ci`, `en_US.utf8`, `C`.
pub fn validate_collation(collation: &str) -> SyncResult<&str> {
    let ok = !collation.is_empty()
        && collation.len() <= MAX_IDENT_LEN
        && collation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(collation)
    } else {
        Err(SyncError::InvalidIdentifier(collation.to_string()))
    }
}

/// Quote `column` after checking it against the destination structure.
fn allowed_column(
    column: &ColumnName,
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<String> {
    if !dest.contains(column.as_str()) {
        return Err(SyncError::InvalidIdentifier(column.0.clone()));
    }
    Ok(dialect.quote_ident(validate_ident(column.as_str())?))
}

fn quoted_table(table: &TableName, dialect: &dyn QueryDialect) -> SyncResult<String> {
    Ok(dialect.quote_ident(validate_ident(table.as_str())?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Query builders
// ─────────────────────────────────────────────────────────────────────────────

/// `SELECT * FROM <table> ORDER BY <pk>`, used for SQLite.
pub fn build_select_query(
    table: &TableName,
    pk: &ColumnName,
    dialect: &dyn QueryDialect,
) -> SyncResult<String> {
    Ok(format!(
        "SELECT * FROM {} ORDER BY {}",
        quoted_table(table, dialect)?,
        dialect.quote_ident(validate_ident(pk.as_str())?)
    ))
}

/// Typed SELECT where every column whose base type `sqlx::AnyRow` cannot
/// decode natively is wrapped in the dialect cast (`::TEXT`,
/// `CONVERT(… USING utf8mb4)`).
pub fn build_typed_select_query(
    table: &TableName,
    pk: &ColumnName,
    structure: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<String> {
    let mut col_exprs = Vec::with_capacity(structure.columns().len());
    for column in structure.columns() {
        let q = dialect.quote_ident(validate_ident(&column.name)?);
        if dialect.is_native_type(&column.base_type()) {
            col_exprs.push(q);
        } else {
            col_exprs.push(dialect.cast_to_text(&q));
        }
    }
    Ok(format!(
        "SELECT {} FROM {} ORDER BY {}",
        col_exprs.join(", "),
        quoted_table(table, dialect)?,
        allowed_column(pk, structure, dialect)?
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Statement rendering
// ─────────────────────────────────────────────────────────────────────────────

/// SQL text plus the values to bind, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Render a data statement against the destination structure read by the
/// session. Every column must exist in `dest`.
pub fn render_statement(
    statement: &Statement,
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<RenderedStatement> {
    match statement {
        Statement::Upsert {
            table,
            primary_key,
            bindings,
        } => render_upsert(table, primary_key, bindings, dest, dialect),
        Statement::Delete { table, predicate } => render_delete(table, predicate, dest, dialect),
        Statement::BulkUpsert {
            table,
            primary_key,
            columns,
            rows,
        } => render_bulk_upsert(table, primary_key, columns, rows, dest, dialect),
        Statement::Schema { table, change } => Ok(RenderedStatement {
            sql: render_schema_change(table, change, dest, dialect)?,
            params: Vec::new(),
        }),
    }
}

fn render_upsert(
    table: &TableName,
    primary_key: &ColumnName,
    bindings: &[Binding],
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<RenderedStatement> {
    if !bindings.iter().any(|b| &b.column == primary_key) {
        return Err(SyncError::MissingPrimaryKey(table.0.clone()));
    }

    let mut columns = Vec::with_capacity(bindings.len());
    let mut placeholders = Vec::with_capacity(bindings.len());
    let mut updates = Vec::new();
    let mut params = Vec::with_capacity(bindings.len());
    for (i, binding) in bindings.iter().enumerate() {
        let col_q = allowed_column(&binding.column, dest, dialect)?;
        let ty = validate_declared_type(&binding.declared_type)?;
        placeholders.push(dialect.param(i + 1, ty));
        if &binding.column != primary_key {
            updates.push(col_q.clone());
        }
        columns.push(col_q);
        params.push(binding.value.clone());
    }

    let pk_q = allowed_column(primary_key, dest, dialect)?;
    Ok(RenderedStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) {}",
            quoted_table(table, dialect)?,
            columns.join(", "),
            placeholders.join(", "),
            dialect.upsert_clause(&pk_q, &updates)
        ),
        params,
    })
}

fn render_delete(
    table: &TableName,
    predicate: &[Binding],
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<RenderedStatement> {
    if predicate.is_empty() {
        return Err(SyncError::Query {
            table: table.0.clone(),
            message: "refusing to delete without a predicate".to_string(),
        });
    }

    let mut conditions = Vec::with_capacity(predicate.len());
    let mut params = Vec::with_capacity(predicate.len());
    for (i, binding) in predicate.iter().enumerate() {
        let col_q = allowed_column(&binding.column, dest, dialect)?;
        let ty = validate_declared_type(&binding.declared_type)?;
        conditions.push(format!("{} = {}", col_q, dialect.param(i + 1, ty)));
        params.push(binding.value.clone());
    }

    Ok(RenderedStatement {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            quoted_table(table, dialect)?,
            conditions.join(" AND ")
        ),
        params,
    })
}

fn render_bulk_upsert(
    table: &TableName,
    primary_key: &ColumnName,
    columns: &[(ColumnName, String)],
    rows: &[Vec<SqlValue>],
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<RenderedStatement> {
    if !columns.iter().any(|(c, _)| c == primary_key) {
        return Err(SyncError::MissingPrimaryKey(table.0.clone()));
    }

    let mut cols_q = Vec::with_capacity(columns.len());
    let mut updates = Vec::new();
    for (column, ty) in columns {
        validate_declared_type(ty)?;
        let q = allowed_column(column, dest, dialect)?;
        if column != primary_key {
            updates.push(q.clone());
        }
        cols_q.push(q);
    }

    let mut tuples = Vec::with_capacity(rows.len());
    let mut params = Vec::with_capacity(rows.len() * columns.len());
    for row in rows {
        if row.len() != columns.len() {
            return Err(SyncError::Query {
                table: table.0.clone(),
                message: format!(
                    "bulk row has {} values for {} columns",
                    row.len(),
                    columns.len()
                ),
            });
        }
        let mut placeholders = Vec::with_capacity(row.len());
        for ((_, ty), value) in columns.iter().zip(row) {
            params.push(value.clone());
            placeholders.push(dialect.param(params.len(), ty));
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }

    let pk_q = allowed_column(primary_key, dest, dialect)?;
    Ok(RenderedStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES {} {}",
            quoted_table(table, dialect)?,
            cols_q.join(", "),
            tuples.join(", "),
            dialect.upsert_clause(&pk_q, &updates)
        ),
        params,
    })
}

/// Render one DDL change. New columns are validated as identifiers; existing
/// ones must be present in `dest`.
pub fn render_schema_change(
    table: &TableName,
    change: &SchemaChange,
    dest: &TableStructure,
    dialect: &dyn QueryDialect,
) -> SyncResult<String> {
    let table_q = quoted_table(table, dialect)?;
    match change {
        SchemaChange::ConvertTableCollation { collation } => {
            dialect.convert_collation_sql(&table_q, validate_collation(collation)?)
        }
        SchemaChange::AddColumn {
            column,
            declared_type,
        } => dialect.add_column_sql(
            &table_q,
            &dialect.quote_ident(validate_ident(column.as_str())?),
            validate_declared_type(declared_type)?,
        ),
        SchemaChange::ModifyColumnType {
            column,
            declared_type,
        } => dialect.modify_column_sql(
            &table_q,
            &allowed_column(column, dest, dialect)?,
            validate_declared_type(declared_type)?,
        ),
        SchemaChange::ModifyColumnCollation {
            column,
            declared_type,
            collation,
        } => dialect.modify_collation_sql(
            &table_q,
            &allowed_column(column, dest, dialect)?,
            validate_declared_type(declared_type)?,
            validate_collation(collation)?,
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::ColumnDefinition;
    use crate::infrastructure::db::dialect::{MysqlDialect, PostgresDialect, SqliteDialect};

    fn dest() -> TableStructure {
        TableStructure::new(vec![
            ColumnDefinition::new("id", "int", None),
            ColumnDefinition::new("name", "varchar(20)", Some("utf8mb4_bin")),
            ColumnDefinition::new("price", "decimal(10,2)", None),
        ])
    }

    fn upsert() -> Statement {
        Statement::Upsert {
            table: TableName::new("items"),
            primary_key: ColumnName::new("id"),
            bindings: vec![
                Binding::new("id", "int", SqlValue::Int(1)),
                Binding::new("name", "varchar(20)", SqlValue::Text("it's".into())),
            ],
        }
    }

    #[test]
    fn mysql_upsert_binds_values() {
        let r = render_statement(&upsert(), &dest(), &MysqlDialect).unwrap();
        assert_eq!(
            r.sql,
            "INSERT INTO `items` (`id`, `name`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
        assert_eq!(r.params[1], SqlValue::Text("it's".into()));
        assert!(!r.sql.contains("it's"));
    }

    #[test]
    fn postgres_upsert_casts_params() {
        let r = render_statement(&upsert(), &dest(), &PostgresDialect).unwrap();
        assert_eq!(
            r.sql,
            r#"INSERT INTO "items" ("id", "name") VALUES (CAST($1 AS int), CAST($2 AS varchar(20))) ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name""#
        );
    }

    #[test]
    fn delete_uses_every_predicate_column() {
        let stmt = Statement::Delete {
            table: TableName::new("items"),
            predicate: vec![
                Binding::new("id", "int", SqlValue::Int(3)),
                Binding::new("name", "varchar(20)", SqlValue::Text("c".into())),
            ],
        };
        let r = render_statement(&stmt, &dest(), &SqliteDialect).unwrap();
        assert_eq!(r.sql, r#"DELETE FROM "items" WHERE "id" = ? AND "name" = ?"#);
        assert_eq!(r.params.len(), 2);
    }

    #[test]
    fn delete_without_predicate_is_refused() {
        let stmt = Statement::Delete {
            table: TableName::new("items"),
            predicate: vec![],
        };
        assert!(render_statement(&stmt, &dest(), &MysqlDialect).is_err());
    }

    #[test]
    fn unknown_column_is_rejected() {
        let stmt = Statement::Upsert {
            table: TableName::new("items"),
            primary_key: ColumnName::new("id"),
            bindings: vec![
                Binding::new("id", "int", SqlValue::Int(1)),
                Binding::new("evil`; DROP TABLE x; --", "int", SqlValue::Int(1)),
            ],
        };
        let err = render_statement(&stmt, &dest(), &MysqlDialect).unwrap_err();
        assert!(matches!(err, SyncError::InvalidIdentifier(_)));
    }

    #[test]
    fn bulk_upsert_numbers_placeholders_across_rows() {
        let stmt = Statement::BulkUpsert {
            table: TableName::new("items"),
            primary_key: ColumnName::new("id"),
            columns: vec![
                (ColumnName::new("id"), "int".into()),
                (ColumnName::new("price"), "decimal(10,2)".into()),
            ],
            rows: vec![
                vec![SqlValue::Int(1), SqlValue::Float(1.5)],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        };
        let r = render_statement(&stmt, &dest(), &PostgresDialect).unwrap();
        assert!(r.sql.contains("(CAST($3 AS int), CAST($4 AS decimal(10,2)))"), "{}", r.sql);
        assert_eq!(r.params.len(), 4);
    }

    #[test]
    fn schema_changes_render_per_dialect() {
        let table = TableName::new("items");
        let add = SchemaChange::AddColumn {
            column: ColumnName::new("amount"),
            declared_type: "decimal(12,2)".into(),
        };
        assert_eq!(
            render_schema_change(&table, &add, &dest(), &MysqlDialect).unwrap(),
            "ALTER TABLE `items` ADD COLUMN `amount` decimal(12,2)"
        );

        let modify = SchemaChange::ModifyColumnType {
            column: ColumnName::new("name"),
            declared_type: "varchar(255)".into(),
        };
        assert_eq!(
            render_schema_change(&table, &modify, &dest(), &PostgresDialect).unwrap(),
            r#"ALTER TABLE "items" ALTER COLUMN "name" TYPE varchar(255)"#
        );
        assert!(render_schema_change(&table, &modify, &dest(), &SqliteDialect).is_err());
    }

    #[test]
    fn declared_types_are_allow_listed() {
        assert!(validate_declared_type("enum('a','b')").is_ok());
        assert!(validate_declared_type("int(11) unsigned").is_ok());
        assert!(validate_declared_type("int; DROP TABLE t").is_err());
        assert!(validate_declared_type("int -- x").is_err());
        assert!(validate_declared_type("enum('a)").is_err());
        assert!(validate_collation("utf8mb4_unicode_ci").is_ok());
        assert!(validate_collation("x' OR 1").is_err());
    }

    #[test]
    fn typed_select_casts_non_native_columns() {
        let q = build_typed_select_query(
            &TableName::new("items"),
            &ColumnName::new("id"),
            &dest(),
            &MysqlDialect,
        )
        .unwrap();
        assert_eq!(
            q,
            "SELECT `id`, CONVERT(`name` USING utf8mb4) AS `name`, \
             CONVERT(`price` USING utf8mb4) AS `price` FROM `items` ORDER BY `id`"
        );
        assert_eq!(
            build_select_query(&TableName::new("items"), &ColumnName::new("id"), &SqliteDialect)
                .unwrap(),
            r#"SELECT * FROM "items" ORDER BY "id""#
        );
    }
}
