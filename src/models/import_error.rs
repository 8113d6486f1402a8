use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row that could not be imported. Written once per failing row, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportError {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-based data-row position in the uploaded file (header excluded).
    pub row_number: i64,
    pub field_name: Option<String>,
    pub error_message: String,
    /// Raw values of the row as they appeared in the file.
    pub row_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row error as produced by the worker, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImportError {
    pub job_id: Uuid,
    pub row_number: i64,
    pub field_name: Option<String>,
    pub error_message: String,
    pub row_data: serde_json::Value,
}
