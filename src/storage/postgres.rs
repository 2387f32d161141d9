//! PostgreSQL implementation of [`Storage`].
//!
//! Uses `deadpool-postgres` for connection pooling. Parameters are encoded
//! according to the type the server expects for each placeholder, so a
//! decoded payload value can be bound to INT, NUMERIC, TEXT, TIMESTAMPTZ and
//! similar columns without per-column configuration.

use super::{split_qualified, Storage};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::value::{FieldMap, FieldValue, Number};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;
use tracing::{debug, warn};
use uuid::Uuid;

const PROCEDURE_PARAMETERS_SQL: &str = "\
    SELECT p.parameter_name::text AS parameter_name \
    FROM information_schema.parameters p \
    JOIN information_schema.routines r \
      ON r.specific_schema = p.specific_schema AND r.specific_name = p.specific_name \
    WHERE lower(r.routine_schema::text) = lower($1) \
      AND lower(r.routine_name::text) = lower($2) \
      AND p.parameter_mode IN ('IN', 'INOUT') \
    ORDER BY p.ordinal_position";

/// Pooled PostgreSQL storage
pub struct PgStorage {
    pool: deadpool_postgres::Pool,
    query_timeout: Duration,
}

impl PgStorage {
    /// Create the pool. Connectivity is not checked until the first statement.
    pub fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pg_config: tokio_postgres::Config = config
            .connection_string
            .parse()
            .map_err(|e| BridgeError::config(format!("Invalid connection string: {}", e)))?;

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr =
            deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);

        let pool = deadpool_postgres::Pool::builder(mgr)
            .max_size(config.max_pool_size)
            .build()
            .map_err(|e| BridgeError::storage(format!("Pool creation failed: {}", e)))?;

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        })
    }

    async fn client(&self) -> BridgeResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| BridgeError::storage(format!("Failed to get connection: {}", e)))
    }

    async fn bounded<T, F>(&self, sql: &str, fut: F) -> BridgeResult<T>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                BridgeError::storage(format!(
                    "Statement timed out after {:?}: {}",
                    self.query_timeout, sql
                ))
            })?
            .map_err(|e| BridgeError::storage(format!("Statement failed: {}", e)))
    }
}

fn param_refs(params: &[FieldValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Storage for PgStorage {
    async fn query(&self, sql: &str, params: &[FieldValue]) -> BridgeResult<Vec<FieldMap>> {
        let client = self.client().await?;
        let refs = param_refs(params);
        let rows = self.bounded(sql, client.query(sql, &refs)).await?;
        debug!("Query returned {} rows", rows.len());
        Ok(rows.iter().map(row_to_fields).collect())
    }

    async fn execute(&self, sql: &str, params: &[FieldValue]) -> BridgeResult<u64> {
        let client = self.client().await?;
        let refs = param_refs(params);
        self.bounded(sql, client.execute(sql, &refs)).await
    }

    async fn introspect(&self, procedure: &str) -> BridgeResult<Vec<String>> {
        let (schema, name) = split_qualified(procedure, "public")?;
        let rows = self
            .query(
                PROCEDURE_PARAMETERS_SQL,
                &[FieldValue::from(schema), FieldValue::from(name)],
            )
            .await?;

        if rows.is_empty() {
            debug!("Procedure {}.{} declares no input parameters", schema, name);
        }

        Ok(rows
            .iter()
            .map(|row| {
                row.get("parameter_name")
                    .map(FieldValue::as_text)
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn call(&self, procedure: &str, params: &[FieldValue]) -> BridgeResult<u64> {
        let (schema, name) = split_qualified(procedure, "public")?;
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let sql = format!("CALL {}.{}({})", schema, name, placeholders.join(", "));
        self.execute(&sql, params).await
    }
}

fn row_to_fields(row: &Row) -> FieldMap {
    let mut fields = FieldMap::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = read_column(row, idx, column.type_()).unwrap_or_else(|e| {
            warn!(
                "Unsupported value in column '{}' ({}): {}",
                column.name(),
                column.type_(),
                e
            );
            FieldValue::Null
        });
        fields.insert(column.name(), value);
    }
    fields
}

fn read_column(row: &Row, idx: usize, ty: &Type) -> Result<FieldValue, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(FieldValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| FieldValue::from(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| FieldValue::from(i64::from(v))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(FieldValue::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| FieldValue::from(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(FieldValue::from),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(FieldValue::from),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| FieldValue::String(v.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| FieldValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| FieldValue::String(v.to_string())),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map(|v| FieldValue::String(v.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| FieldValue::String(v.to_string())),
        _ => row.try_get::<_, Option<String>>(idx)?.map(FieldValue::String),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

type EncodeError = Box<dyn Error + Sync + Send>;

impl FieldValue {
    fn to_pg_bool(&self) -> Result<bool, EncodeError> {
        match self {
            FieldValue::Bool(b) => Ok(*b),
            FieldValue::Number(n) => Ok(n.as_decimal().map(|d| !d.is_zero()).unwrap_or(false)),
            FieldValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Ok(true),
                "false" | "f" | "0" | "no" | "n" => Ok(false),
                other => Err(format!("cannot convert '{}' to boolean", other).into()),
            },
            FieldValue::Null => Err("NULL has no boolean value".into()),
        }
    }

    fn to_pg_i64(&self) -> Result<i64, EncodeError> {
        let integer = match self {
            FieldValue::Number(n) => n.as_i64(),
            FieldValue::String(s) => s.trim().parse::<i64>().ok(),
            FieldValue::Bool(b) => Some(i64::from(*b)),
            FieldValue::Null => None,
        };
        integer.ok_or_else(|| format!("cannot convert '{}' to integer", self).into())
    }

    fn to_pg_f64(&self) -> Result<f64, EncodeError> {
        let float = match self {
            FieldValue::Number(n) => n.as_f64(),
            FieldValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        float.ok_or_else(|| format!("cannot convert '{}' to float", self).into())
    }

    fn to_pg_decimal(&self) -> Result<Decimal, EncodeError> {
        self.as_decimal()
            .ok_or_else(|| format!("cannot convert '{}' to numeric", self).into())
    }

    fn to_pg_timestamptz(&self) -> Result<DateTime<Utc>, EncodeError> {
        let text = self.as_text();
        DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("cannot convert '{}' to timestamptz: {}", text, e).into())
    }

    fn to_pg_timestamp(&self) -> Result<NaiveDateTime, EncodeError> {
        let text = self.as_text();
        let text = text.trim();
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
            .map_err(|e| format!("cannot convert '{}' to timestamp: {}", text, e).into())
    }

    fn to_pg_json(&self) -> serde_json::Value {
        match self {
            FieldValue::String(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
            }
            other => other.to_json(),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, EncodeError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => self.to_pg_bool()?.to_sql(ty, out),
            Type::INT2 => i16::try_from(self.to_pg_i64()?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(self.to_pg_i64()?)?.to_sql(ty, out),
            Type::INT8 => self.to_pg_i64()?.to_sql(ty, out),
            Type::FLOAT4 => (self.to_pg_f64()? as f32).to_sql(ty, out),
            Type::FLOAT8 => self.to_pg_f64()?.to_sql(ty, out),
            Type::NUMERIC => self.to_pg_decimal()?.to_sql(ty, out),
            Type::TIMESTAMPTZ => self.to_pg_timestamptz()?.to_sql(ty, out),
            Type::TIMESTAMP => self.to_pg_timestamp()?.to_sql(ty, out),
            Type::UUID => Uuid::parse_str(self.as_text().trim())?.to_sql(ty, out),
            Type::JSON | Type::JSONB => self.to_pg_json().to_sql(ty, out),
            _ => match self {
                // Integral values bound to an untyped parameter keep their number form
                FieldValue::Number(Number::Decimal(d)) => d.to_string().as_str().to_sql(ty, out),
                other => other.as_text().as_str().to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
