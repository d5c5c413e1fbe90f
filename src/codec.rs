use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FleetwireError, Result};

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| FleetwireError::Serialization(e.to_string()))
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| FleetwireError::Serialization(e.to_string()))
}
