use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use snowflake_connector_rs::{
    SnowflakeAuthMethod, SnowflakeClient, SnowflakeClientConfig, SnowflakeSession,
};
use tracing::debug;

use crate::config::WarehouseConfig;
use crate::error::QueryError;

/// Runs the SQL an agent answer carries.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryResult, QueryError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Fixed-width text table, one line per row.
    pub fn to_table_string(&self) -> String {
        if self.columns.is_empty() {
            return "(no columns)".to_string();
        }

        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &cells {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let format_line = |values: &[String]| {
            values
                .iter()
                .zip(&widths)
                .map(|(value, width)| format!("{:<width$}", value, width = *width))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut lines = vec![format_line(&self.columns)];
        lines.push(
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        lines.extend(cells.iter().map(|row| format_line(row)));
        lines.push(format!("({} rows)", self.rows.len()));
        lines.join("\n")
    }
}

/// JSON decoding first, then the raw string, then `NULL`.
fn cell_value<F>(as_json: Option<Value>, as_text: F) -> Value
where
    F: FnOnce() -> Option<String>,
{
    as_json
        .or_else(|| as_text().map(Value::String))
        .unwrap_or(Value::Null)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Password session against a Snowflake warehouse.
#[derive(Clone)]
pub struct SnowflakeEngine {
    session: Arc<SnowflakeSession>,
    account: String,
    warehouse: Option<String>,
}

impl fmt::Debug for SnowflakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeEngine")
            .field("account", &self.account)
            .field("warehouse", &self.warehouse)
            .finish()
    }
}

impl SnowflakeEngine {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, QueryError> {
        let client = SnowflakeClient::new(
            &config.user,
            SnowflakeAuthMethod::Password(config.password.clone()),
            SnowflakeClientConfig {
                account: config.account.clone(),
                role: config.role.clone(),
                warehouse: config.warehouse.clone(),
                database: config.database.clone(),
                schema: config.schema.clone(),
                timeout: Some(Duration::from_secs(30)),
            },
        )
        .map_err(|e| QueryError::Connect(e.to_string()))?;
        let session = client
            .create_session()
            .await
            .map_err(|e| QueryError::Connect(e.to_string()))?;

        Ok(Self {
            session: Arc::new(session),
            account: config.account.clone(),
            warehouse: config.warehouse.clone(),
        })
    }
}

#[async_trait]
impl QueryExecutor for SnowflakeEngine {
    async fn execute(&self, sql: &str) -> Result<QueryResult, QueryError> {
        let mut cleaned_query = sql.trim().to_string();
        if cleaned_query.ends_with(';') {
            cleaned_query.pop();
        }
        debug!(sql = %cleaned_query, "executing agent SQL");

        let results = self
            .session
            .query(cleaned_query.as_str())
            .await
            .map_err(|e| QueryError::Execute(e.to_string()))?;

        let columns: Vec<String> = results.first().map_or(Vec::new(), |first_row| {
            first_row
                .column_types()
                .into_iter()
                .map(|col| col.name().to_string())
                .collect()
        });

        let rows = results
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|name| {
                        cell_value(row.get::<Value>(name).ok(), || row.get::<String>(name).ok())
                    })
                    .collect()
            })
            .collect();

        Ok(QueryResult { columns, rows })
    }
}
