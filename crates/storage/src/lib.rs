use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use realtime_store::{
    ChangeBroker, ChangeEvent, RealtimeStore, Record, RowFilter, SortOrder, Subscription, Table,
};
use serde_json::Value;
use shared::error::{ApiException, ErrorCode};
use sqlx::{
    error::ErrorKind,
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};
use uuid::Uuid;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed table store that publishes a change event for every
/// successful write, mirroring a hosted store's realtime channel.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: ChangeBroker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Text,
    NullableText,
    Bool,
    Integer,
}

#[derive(Debug, Clone, Copy)]
struct Column {
    name: &'static str,
    ty: ColumnType,
}

const fn column(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

const DONOR_COLUMNS: &[Column] = &[
    column("id", ColumnType::Text),
    column("name", ColumnType::Text),
    column("blood_type", ColumnType::Text),
    column("last_donation_date", ColumnType::NullableText),
    column("contact", ColumnType::Text),
    column("location", ColumnType::Text),
    column("is_available", ColumnType::Bool),
    column("last_notified", ColumnType::NullableText),
    column("created_at", ColumnType::Text),
];

const EMERGENCY_COLUMNS: &[Column] = &[
    column("id", ColumnType::Text),
    column("blood_type", ColumnType::Text),
    column("hospital", ColumnType::Text),
    column("units_needed", ColumnType::Integer),
    column("urgency", ColumnType::Text),
    column("created_at", ColumnType::Text),
];

fn columns(table: Table) -> &'static [Column] {
    match table {
        Table::Donors => DONOR_COLUMNS,
        Table::Emergencies => EMERGENCY_COLUMNS,
    }
}

fn find_column(table: Table, name: &str) -> Result<Column, ApiException> {
    columns(table)
        .iter()
        .copied()
        .find(|column| column.name == name)
        .ok_or_else(|| ApiException::validation(format!("unknown column {name} on {table}")))
}

fn column_list(table: Table) -> String {
    columns(table)
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database, so pin the pool to one.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        info!(%database_url, "storage ready");
        Ok(Self {
            pool,
            changes: ChangeBroker::new(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn changes(&self) -> &ChangeBroker {
        &self.changes
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn count_rows(&self, table: Table) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(count)
    }

    async fn fetch_row(&self, table: Table, id: &str) -> Result<Option<Record>, ApiException> {
        let sql = format!("SELECT {} FROM {table} WHERE id = ?", column_list(table));
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| row_to_record(table, &row)).transpose()
    }
}

#[async_trait]
impl RealtimeStore for Storage {
    async fn query(&self, table: Table, filter: &RowFilter) -> Result<Vec<Record>, ApiException> {
        let mut clauses = Vec::new();
        for (name, _) in &filter.equals {
            find_column(table, name)?;
            clauses.push(format!("{name} = ?"));
        }
        for (name, _) in &filter.contains_ci {
            find_column(table, name)?;
            clauses.push(format!("LOWER({name}) LIKE ? ESCAPE '\\'"));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let order = match filter.order {
            SortOrder::NewestFirst => "created_at DESC, rowid DESC",
            SortOrder::OldestFirst => "created_at ASC, rowid ASC",
        };
        let sql = format!(
            "SELECT {} FROM {table}{where_clause} ORDER BY {order}",
            column_list(table)
        );

        let mut query = sqlx::query(&sql);
        for (name, value) in &filter.equals {
            query = bind_value(query, find_column(table, name)?, value)?;
        }
        for (_, needle) in &filter.contains_ci {
            query = query.bind(format!("%{}%", escape_like(&needle.to_lowercase())));
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(|row| row_to_record(table, row)).collect()
    }

    async fn insert(&self, table: Table, mut record: Record) -> Result<Record, ApiException> {
        record
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        record
            .entry("created_at")
            .or_insert_with(|| Value::String(timestamp_now()));
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiException::validation("id must be a string"))?;

        let mut names = Vec::with_capacity(record.len());
        let mut bound = Vec::with_capacity(record.len());
        for (name, value) in &record {
            bound.push((find_column(table, name)?, value));
            names.push(name.as_str());
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for (column, value) in bound {
            query = bind_value(query, column, value)?;
        }
        query.execute(&self.pool).await.map_err(map_sqlx_error)?;

        let stored = self
            .fetch_row(table, &id)
            .await?
            .ok_or_else(|| ApiException::internal(format!("inserted row {id} vanished")))?;
        let delivered = self
            .changes
            .publish(&ChangeEvent::inserted(table, stored.clone()));
        debug!(%table, row_id = %id, delivered, "row inserted");
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, fields: Record) -> Result<(), ApiException> {
        if fields.is_empty() {
            return Err(ApiException::validation("update requires at least one field"));
        }

        let mut assignments = Vec::with_capacity(fields.len());
        let mut bound = Vec::with_capacity(fields.len());
        for (name, value) in &fields {
            if name == "id" {
                return Err(ApiException::validation("id cannot be updated"));
            }
            bound.push((find_column(table, name)?, value));
            assignments.push(format!("{name} = ?"));
        }
        let sql = format!("UPDATE {table} SET {} WHERE id = ?", assignments.join(", "));

        let mut query = sqlx::query(&sql);
        for (column, value) in bound {
            query = bind_value(query, column, value)?;
        }
        let result = query
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            debug!(%table, row_id = %id, "update matched no rows");
            return Ok(());
        }

        if let Some(stored) = self.fetch_row(table, id).await? {
            let mut old = Record::new();
            old.insert("id".into(), Value::String(id.to_string()));
            self.changes
                .publish(&ChangeEvent::updated(table, stored, old));
        }
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), ApiException> {
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            debug!(%table, row_id = %id, "delete matched no rows");
            return Ok(());
        }

        let mut old = Record::new();
        old.insert("id".into(), Value::String(id.to_string()));
        self.changes.publish(&ChangeEvent::deleted(table, old));
        Ok(())
    }

    async fn subscribe_table(&self, table: Table) -> Result<Subscription, ApiException> {
        Ok(self.changes.subscribe(table))
    }
}

fn bind_value<'q>(
    query: SqliteQuery<'q>,
    column: Column,
    value: &Value,
) -> Result<SqliteQuery<'q>, ApiException> {
    let query = match (column.ty, value) {
        (ColumnType::NullableText, Value::Null) => query.bind(Option::<String>::None),
        (ColumnType::Text | ColumnType::NullableText, Value::String(text)) => {
            query.bind(text.clone())
        }
        (ColumnType::Bool, Value::Bool(flag)) => query.bind(*flag),
        (ColumnType::Integer, Value::Number(number)) => {
            let Some(number) = number.as_i64() else {
                return Err(ApiException::validation(format!(
                    "column {} expects an integer, got {number}",
                    column.name
                )));
            };
            query.bind(number)
        }
        _ => {
            return Err(ApiException::validation(format!(
                "invalid value for column {}: {value}",
                column.name
            )))
        }
    };
    Ok(query)
}

fn row_to_record(table: Table, row: &SqliteRow) -> Result<Record, ApiException> {
    let mut record = Record::new();
    for column in columns(table) {
        let value = match column.ty {
            ColumnType::Text => Value::String(row.try_get(column.name).map_err(map_sqlx_error)?),
            ColumnType::NullableText => row
                .try_get::<Option<String>, _>(column.name)
                .map_err(map_sqlx_error)?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnType::Bool => Value::Bool(row.try_get(column.name).map_err(map_sqlx_error)?),
            ColumnType::Integer => {
                Value::from(row.try_get::<i64, _>(column.name).map_err(map_sqlx_error)?)
            }
        };
        record.insert(column.name.to_string(), value);
    }
    Ok(record)
}

fn map_sqlx_error(error: sqlx::Error) -> ApiException {
    if let Some(database_error) = error.as_database_error() {
        let code = match database_error.kind() {
            ErrorKind::UniqueViolation => ErrorCode::Conflict,
            ErrorKind::NotNullViolation | ErrorKind::CheckViolation => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        };
        return ApiException::new(code, database_error.message().to_string());
    }
    match error {
        sqlx::Error::RowNotFound => ApiException::new(ErrorCode::NotFound, "row not found"),
        other => ApiException::internal(other.to_string()),
    }
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
