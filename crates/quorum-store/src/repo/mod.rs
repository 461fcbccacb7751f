pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod consensus;
pub mod files;
pub mod tasks;

pub use audit::*;
pub use bootstrap::*;
pub use config::*;
pub use consensus::*;
pub use files::*;
pub use tasks::*;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Serialize a snake_case enum to its bare string token.
pub(crate) fn to_token<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(StoreError::InvalidRow(format!(
            "expected string token, got {other}"
        ))),
    }
}

pub(crate) fn from_token<T: DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(StoreError::from)
}
