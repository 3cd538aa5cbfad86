use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::value_objects::ColumnName;

/// One column as declared on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Declared type as the engine reports it, e.g. `varchar(255)`, `decimal(10,2)`.
    pub declared_type: String,
    pub collation: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: &str, declared_type: &str, collation: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            collation: collation.map(str::to_string),
        }
    }

    /// Lowercased declared type with length/precision and modifiers stripped:
    /// `int(11) unsigned` → `int`, `character varying(20)` → `character varying`.
    pub fn base_type(&self) -> String {
        base_type(&self.declared_type)
    }
}

/// See [`ColumnDefinition::base_type`].
pub fn base_type(declared: &str) -> String {
    let lower = declared.trim().to_ascii_lowercase();
    let head = lower.split('(').next().unwrap_or_default();
    head.trim_end_matches(" unsigned")
        .trim_end_matches(" zerofill")
        .trim()
        .to_string()
}

/// Column set of one side of a table, kept in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStructure {
    columns: Vec<ColumnDefinition>,
}

impl TableStructure {
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names, used as the identifier allow-list for statements.
    pub fn column_names(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub(crate) fn columns_mut(&mut self) -> &mut Vec<ColumnDefinition> {
        &mut self.columns
    }
}

/// A single corrective DDL operation on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    ConvertTableCollation {
        collation: String,
    },
    AddColumn {
        column: ColumnName,
        declared_type: String,
    },
    ModifyColumnType {
        column: ColumnName,
        declared_type: String,
    },
    ModifyColumnCollation {
        column: ColumnName,
        declared_type: String,
        collation: String,
    },
}

impl SchemaChange {
    pub fn column(&self) -> Option<&ColumnName> {
        match self {
            SchemaChange::ConvertTableCollation { .. } => None,
            SchemaChange::AddColumn { column, .. }
            | SchemaChange::ModifyColumnType { column, .. }
            | SchemaChange::ModifyColumnCollation { column, .. } => Some(column),
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::ConvertTableCollation { collation } => {
                write!(f, "convert table to collation {}", collation)
            }
            SchemaChange::AddColumn {
                column,
                declared_type,
            } => write!(f, "add column {} {}", column, declared_type),
            SchemaChange::ModifyColumnType {
                column,
                declared_type,
            } => write!(f, "modify column {} to {}", column, declared_type),
            SchemaChange::ModifyColumnCollation {
                column, collation, ..
            } => write!(f, "set collation of {} to {}", column, collation),
        }
    }
}

/// Differences between the source and destination structure of one table.
///
/// Only additive/corrective changes are ever planned: columns that exist only
/// at the destination are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaDiff {
    pub changes: Vec<SchemaChange>,
}

impl SchemaDiff {
    /// Plan the table-level and column-level changes, table collation first,
    /// then columns in source order.
    pub fn between(
        source: &TableStructure,
        dest: &TableStructure,
        source_collation: Option<&str>,
        dest_collation: Option<&str>,
    ) -> Self {
        let mut changes = Vec::new();
        if let Some(change) = plan_table_collation(source_collation, dest_collation) {
            changes.push(change);
        }
        changes.extend(plan_columns(source, dest));
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn additions(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes
            .iter()
            .filter(|c| matches!(c, SchemaChange::AddColumn { .. }))
    }

    pub fn modifications(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes
            .iter()
            .filter(|c| matches!(c, SchemaChange::ModifyColumnType { .. }))
    }

    pub fn collation_changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| {
            matches!(
                c,
                SchemaChange::ConvertTableCollation { .. }
                    | SchemaChange::ModifyColumnCollation { .. }
            )
        })
    }
}

/// Table-level collation change, if the source declares one that differs.
pub fn plan_table_collation(source: Option<&str>, dest: Option<&str>) -> Option<SchemaChange> {
    match source {
        Some(src) if Some(src) != dest => Some(SchemaChange::ConvertTableCollation {
            collation: src.to_string(),
        }),
        _ => None,
    }
}

/// Column-level changes in source-column order.
pub fn plan_columns(source: &TableStructure, dest: &TableStructure) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for src in source.columns() {
        let column = ColumnName(src.name.clone());
        match dest.get(&src.name) {
            None => changes.push(SchemaChange::AddColumn {
                column,
                declared_type: src.declared_type.clone(),
            }),
            Some(dst) if !same_type(&src.declared_type, &dst.declared_type) => {
                changes.push(SchemaChange::ModifyColumnType {
                    column,
                    declared_type: src.declared_type.clone(),
                })
            }
            Some(dst) => {
                if let Some(collation) = &src.collation {
                    if src.collation != dst.collation {
                        changes.push(SchemaChange::ModifyColumnCollation {
                            column,
                            declared_type: src.declared_type.clone(),
                            collation: collation.clone(),
                        });
                    }
                }
            }
        }
    }
    changes
}

fn same_type(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Character set implied by a MySQL collation name: `utf8mb4_unicode_ci` → `utf8mb4`.
pub fn charset_of(collation: &str) -> &str {
    collation.split('_').next().unwrap_or(collation)
}
