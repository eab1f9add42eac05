//! String codecs between domain enums/blobs and TEXT columns.

use serde::Serialize;
use serde::de::DeserializeOwned;

use tunetrail_repo::RepoError;

/// Encode a unit enum to its serde string form.
pub fn enum_to_str<T: Serialize>(value: &T) -> Result<String, RepoError> {
    match serde_json::to_value(value).map_err(|e| RepoError::Serialization(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(RepoError::Serialization(format!(
            "expected string-encoded enum, got {other}"
        ))),
    }
}

/// Decode a unit enum from its serde string form.
pub fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, RepoError> {
    serde_json::from_value(serde_json::Value::String(s.to_owned()))
        .map_err(|e| RepoError::Serialization(e.to_string()))
}

/// Encode any serde value as a JSON TEXT column.
pub fn json_to_text<T: Serialize>(value: &T) -> Result<String, RepoError> {
    serde_json::to_string(value).map_err(|e| RepoError::Serialization(e.to_string()))
}

/// Decode a JSON TEXT column.
pub fn json_from_text<T: DeserializeOwned>(s: &str) -> Result<T, RepoError> {
    serde_json::from_str(s).map_err(|e| RepoError::Serialization(e.to_string()))
}
