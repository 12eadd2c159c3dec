//! Timestamp helpers for version directories and artifact envelopes.
//!
//! Version timestamps are compact UTC strings (`20261019T093015123Z`) so that
//! lexicographic order equals chronological order and they are safe inside
//! directory names.

use crate::core::error::AgentCertError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use ulid::Ulid;

const VERSION_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A version timestamp naming one directory in an append-only history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(VERSION_FORMAT).to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, AgentCertError> {
        let trimmed = raw.strip_suffix('Z').ok_or_else(|| {
            AgentCertError::ValidationError(format!(
                "invalid timestamp '{}': expected YYYYMMDDTHHMMSSmmmZ",
                raw
            ))
        })?;
        NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S%3f").map_err(|e| {
            AgentCertError::ValidationError(format!("invalid timestamp '{}': {}", raw, e))
        })?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = AgentCertError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

/// RFC 3339 with second precision, used for `generatedAt`-style fields.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn to_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, AgentCertError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AgentCertError::ValidationError(format!("invalid RFC 3339 time '{}': {}", raw, e)))
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_rfc3339(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
