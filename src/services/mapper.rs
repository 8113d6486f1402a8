//! Row mapper contract.
//!
//! A mapper turns one parsed row into a validated [`EntityCommand`] or a
//! [`RowError`]. Mappers are pure: all persistence goes through
//! [`crate::services::entities::EntityCreator`], called by the worker only for
//! rows the mapper accepted.

use garde::Report;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strsim::jaro_winkler;
use uuid::Uuid;

use crate::models::job::EntityType;
use crate::services::parser::{Columns, Row};

/// Similarity above which an unknown header is offered as a suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Tenant scope a row is imported into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub workspace_id: Uuid,
    pub user_id: Option<Uuid>,
}

/// Validated creation command for one domain entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCommand {
    pub entity_type: EntityType,
    /// Business identity of the entity within its workspace (e.g. a SKU).
    pub natural_key: String,
    pub payload: serde_json::Value,
}

impl EntityCommand {
    pub fn new<T: Serialize>(
        entity_type: EntityType,
        natural_key: impl Into<String>,
        command: &T,
    ) -> Result<Self, RowError> {
        let payload = serde_json::to_value(command)
            .map_err(|e| RowError::new(format!("could not encode row: {}", e)))?;
        Ok(Self {
            entity_type,
            natural_key: natural_key.into(),
            payload,
        })
    }
}

/// Why a row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RowError {
    pub field_name: Option<String>,
    pub message: String,
}

impl RowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field_name: None,
            message: message.into(),
        }
    }

    pub fn field(field_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_name: Some(field_name.into()),
            message: message.into(),
        }
    }

    /// First failure of a `garde` report, keyed by the offending field.
    pub fn from_report(report: &Report) -> Self {
        match report.iter().next() {
            Some((path, error)) => {
                let field = path.to_string();
                if field.is_empty() {
                    RowError::new(error.to_string())
                } else {
                    RowError::field(field, error.to_string())
                }
            }
            None => RowError::new("validation failed"),
        }
    }
}

pub trait RowMapper: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Column keys (normalized header names) every file must carry.
    fn required_columns(&self) -> &'static [&'static str];

    fn map(&self, row: &Row, tenant: &TenantContext) -> Result<EntityCommand, RowError>;
}

/// Required columns absent from a header, with an optional near-miss suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingColumn {
    pub column: &'static str,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for MissingColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suggestion {
            Some(found) => write!(f, "'{}' (found '{}')", self.column, found),
            None => write!(f, "'{}'", self.column),
        }
    }
}

/// Check a header against a mapper's required columns.
pub fn missing_columns(mapper: &dyn RowMapper, columns: &Columns) -> Vec<MissingColumn> {
    mapper
        .required_columns()
        .iter()
        .copied()
        .filter(|required| !columns.contains(required))
        .map(|required| {
            let suggestion = columns
                .keys()
                .iter()
                .map(|key| (key, jaro_winkler(key, required)))
                .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(key, _)| key.clone());
            MissingColumn {
                column: required,
                suggestion,
            }
        })
        .collect()
}

/// Mappers by entity type. An entity type without a mapper is not importable.
#[derive(Clone, Default)]
pub struct MapperRegistry {
    mappers: HashMap<EntityType, Arc<dyn RowMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, mapper: Arc<dyn RowMapper>) -> Self {
        self.mappers.insert(mapper.entity_type(), mapper);
        self
    }

    pub fn get(&self, entity_type: EntityType) -> Option<Arc<dyn RowMapper>> {
        self.mappers.get(&entity_type).cloned()
    }

    /// Resolve an entity type from its path segment, if a mapper exists for it.
    pub fn resolve(&self, name: &str) -> Option<EntityType> {
        EntityType::from_str(name)
            .ok()
            .filter(|t| self.mappers.contains_key(t))
    }
}

// ── Field helpers shared by mappers ─────────────────────────────────

/// Trimmed, non-empty value of a column.
pub fn optional(row: &Row, key: &str) -> Option<String> {
    row.get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn required(row: &Row, key: &str) -> Result<String, RowError> {
    optional(row, key).ok_or_else(|| RowError::field(key, format!("{} is required", key)))
}

pub fn parse_optional<T: FromStr>(row: &Row, key: &str) -> Result<Option<T>, RowError> {
    optional(row, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| RowError::field(key, format!("'{}' is not a valid {}", raw, key)))
        })
        .transpose()
}

pub fn parse_required<T: FromStr>(row: &Row, key: &str) -> Result<T, RowError> {
    parse_optional(row, key)?.ok_or_else(|| RowError::field(key, format!("{} is required", key)))
}
