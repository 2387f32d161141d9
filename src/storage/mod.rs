//! Relational storage seam.
//!
//! The engine only needs four operations from the database; everything SQL
//! dialect specific lives in the implementations (see [`postgres`]).

pub mod postgres;

use crate::error::{BridgeError, BridgeResult};
use crate::value::{FieldMap, FieldValue};
use async_trait::async_trait;

pub use postgres::PgStorage;

/// Relational store used by the writers, the delivery tracker and the SQL config store.
///
/// SQL text uses positional `$n` placeholders bound from `params` in order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run a query and return every row as a field map keyed by column name
    async fn query(&self, sql: &str, params: &[FieldValue]) -> BridgeResult<Vec<FieldMap>>;

    /// Run a statement and return the number of affected rows
    async fn execute(&self, sql: &str, params: &[FieldValue]) -> BridgeResult<u64>;

    /// Ordered input parameter names of a stored procedure
    async fn introspect(&self, procedure: &str) -> BridgeResult<Vec<String>>;

    /// Invoke a stored procedure as a non-query call
    async fn call(&self, procedure: &str, params: &[FieldValue]) -> BridgeResult<u64>;
}

/// Check that a name is a plain SQL identifier (letters, digits, underscore)
pub fn identifier(name: &str) -> BridgeResult<&str> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(name)
    } else {
        Err(BridgeError::mapping(format!("Invalid SQL identifier: '{}'", name)))
    }
}

/// `schema.object` with both parts checked
pub fn qualified_name(schema: &str, object: &str) -> BridgeResult<String> {
    Ok(format!("{}.{}", identifier(schema)?, identifier(object)?))
}

/// Split `schema.name` (or a bare `name` in `default_schema`) into checked parts
pub fn split_qualified<'a>(
    name: &'a str,
    default_schema: &'a str,
) -> BridgeResult<(&'a str, &'a str)> {
    match name.trim().split_once('.') {
        Some((schema, object)) => Ok((identifier(schema)?, identifier(object)?)),
        None => Ok((identifier(default_schema)?, identifier(name)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert_eq!(identifier("TableA").unwrap(), "TableA");
        assert_eq!(identifier(" _private1 ").unwrap(), "_private1");
        assert!(identifier("").is_err());
        assert!(identifier("1abc").is_err());
        assert!(identifier("a;drop table x").is_err());
        assert!(identifier("a b").is_err());
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(qualified_name("dbo", "TableA").unwrap(), "dbo.TableA");
        assert!(qualified_name("dbo", "Table-A").is_err());

        assert_eq!(
            split_qualified("audit.log_reading", "public").unwrap(),
            ("audit", "log_reading")
        );
        assert_eq!(
            split_qualified("log_reading", "public").unwrap(),
            ("public", "log_reading")
        );
        assert!(split_qualified("a.b.c", "public").is_err());
    }
}
