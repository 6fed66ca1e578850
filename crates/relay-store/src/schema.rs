//! Metadata table definitions and the canonical row representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sql::quote_identifier;

/// Database value used by store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    String(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Blob(Vec<u8>),
    Null,
}

/// Canonical row representation, ordered by column name.
pub type Row = BTreeMap<String, DbValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
    String,
    Integer,
}

#[derive(Debug, Clone)]
pub(crate) struct ColumnDef {
    name: String,
    column_type: ColumnType,
    nullable: bool,
    primary_key: bool,
    references: Option<(String, String)>,
}

impl ColumnDef {
    fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: false,
            references: None,
        }
    }

    fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    fn sql(&self) -> String {
        let mut parts = vec![
            quote_identifier(&self.name),
            match self.column_type {
                ColumnType::String => "TEXT".to_string(),
                ColumnType::Integer => "INTEGER".to_string(),
            },
        ];
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if self.primary_key {
            parts.push("PRIMARY KEY".to_string());
        }
        if let Some((table, column)) = &self.references {
            parts.push(format!(
                "REFERENCES {}({})",
                quote_identifier(table),
                quote_identifier(column)
            ));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TableSchema {
    pub(crate) name: String,
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub(crate) fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnDef::sql).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }
}

/// The four metadata tables, in creation order (referenced tables first).
pub(crate) fn metadata_tables() -> Vec<TableSchema> {
    use ColumnType::{Integer, String};

    vec![
        TableSchema::new("report_file")
            .with_column(ColumnDef::new("report_id", String).primary_key())
            .with_column(ColumnDef::new("receiver", String).nullable())
            .with_column(ColumnDef::new("format", String))
            .with_column(ColumnDef::new("blob_url", String))
            .with_column(ColumnDef::new("digest", String))
            .with_column(ColumnDef::new("dedup_hash", String).nullable())
            .with_column(ColumnDef::new("item_count", Integer))
            .with_column(ColumnDef::new("created_at", String)),
        TableSchema::new("task")
            .with_column(
                ColumnDef::new("report_id", String)
                    .primary_key()
                    .references("report_file", "report_id"),
            )
            .with_column(ColumnDef::new("receiver", String).nullable())
            .with_column(ColumnDef::new("next_action", String))
            .with_column(ColumnDef::new("next_action_at", String))
            .with_column(ColumnDef::new("retry_token", String).nullable())
            .with_column(ColumnDef::new("status", String)),
        TableSchema::new("action_log")
            .with_column(ColumnDef::new("action_id", String).primary_key())
            .with_column(ColumnDef::new("action", String))
            .with_column(ColumnDef::new("status", String))
            .with_column(ColumnDef::new("result", String).nullable())
            .with_column(ColumnDef::new("input_report_ids", String).nullable())
            .with_column(ColumnDef::new("created_report_ids", String).nullable())
            .with_column(ColumnDef::new("created_at", String)),
        TableSchema::new("item_lineage")
            .with_column(ColumnDef::new("lineage_id", String).primary_key())
            .with_column(
                ColumnDef::new("child_report_id", String).references("report_file", "report_id"),
            )
            .with_column(ColumnDef::new("child_index", Integer))
            .with_column(
                ColumnDef::new("parent_report_id", String).references("report_file", "report_id"),
            )
            .with_column(ColumnDef::new("parent_index", Integer)),
    ]
}
