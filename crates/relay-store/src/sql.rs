//! SQL statement builders over the canonical row representation.
//!
//! Rows are `BTreeMap`s, so generated column order is deterministic for
//! a given set of columns.

use crate::schema::{DbValue, Row};
use crate::{Error, Result};

pub(crate) fn quote_identifier(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

pub(crate) fn db_value_to_libsql(value: &DbValue) -> libsql::Value {
    match value {
        DbValue::String(value) => libsql::Value::Text(value.clone()),
        DbValue::Blob(value) => libsql::Value::Blob(value.clone()),
        DbValue::Integer(value) => libsql::Value::Integer(*value),
        DbValue::Decimal(value) => libsql::Value::Real(*value),
        DbValue::Boolean(value) => libsql::Value::Integer(i64::from(*value)),
        DbValue::Null => libsql::Value::Null,
    }
}

pub(crate) fn libsql_value_to_db(value: libsql::Value) -> DbValue {
    match value {
        libsql::Value::Null => DbValue::Null,
        libsql::Value::Integer(value) => DbValue::Integer(value),
        libsql::Value::Real(value) => DbValue::Decimal(value),
        libsql::Value::Text(value) => DbValue::String(value),
        libsql::Value::Blob(value) => DbValue::Blob(value),
    }
}

pub(crate) fn build_insert_sql(table: &str, row: &Row) -> Result<(String, Vec<libsql::Value>)> {
    if row.is_empty() {
        return Err(Error::query(table, "Insert row cannot be empty"));
    }

    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (column, value) in row {
        columns.push(quote_identifier(column));
        params.push(db_value_to_libsql(value));
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        columns.join(", "),
        placeholders.join(", ")
    );

    Ok((sql, params))
}

pub(crate) fn build_update_sql(
    table: &str,
    filter: &Row,
    updates: &Row,
) -> Result<(String, Vec<libsql::Value>)> {
    if updates.is_empty() {
        return Err(Error::query(table, "Update row cannot be empty"));
    }
    if filter.is_empty() {
        return Err(Error::query(table, "Update filter cannot be empty"));
    }

    let mut params = Vec::new();
    let mut assignments = Vec::new();
    for (column, value) in updates {
        params.push(db_value_to_libsql(value));
        assignments.push(format!("{} = ?{}", quote_identifier(column), params.len()));
    }

    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_identifier(table),
        assignments.join(", ")
    );

    sql.push_str(" WHERE ");
    sql.push_str(&filter_clauses(filter, &mut params).join(" AND "));

    Ok((sql, params))
}

pub(crate) fn build_select_sql(table: &str, filter: Option<&Row>) -> (String, Vec<libsql::Value>) {
    let mut params = Vec::new();
    let mut sql = format!("SELECT * FROM {}", quote_identifier(table));

    if let Some(filter) = filter {
        let clauses = filter_clauses(filter, &mut params);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
    }

    (sql, params)
}

fn filter_clauses(filter: &Row, params: &mut Vec<libsql::Value>) -> Vec<String> {
    let mut clauses = Vec::new();
    for (column, value) in filter {
        if matches!(value, DbValue::Null) {
            clauses.push(format!("{} IS NULL", quote_identifier(column)));
        } else {
            params.push(db_value_to_libsql(value));
            clauses.push(format!("{} = ?{}", quote_identifier(column), params.len()));
        }
    }
    clauses
}
