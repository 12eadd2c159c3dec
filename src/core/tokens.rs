//! Token estimation.
//!
//! The estimate is a tamper signal: preview stores it, certify recomputes it.
//! It must stay a pure function of the input text, so every caller goes
//! through [`estimate_tokens`] and the same `cl100k_base` encoder.

use crate::core::error::AgentCertError;
use crate::core::integrity;
use serde::Serialize;
use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

static ENCODER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();

fn encoder() -> Result<&'static CoreBPE, AgentCertError> {
    ENCODER
        .get_or_init(|| cl100k_base().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| AgentCertError::TokenizerError(e.clone()))
}

pub fn estimate_tokens(text: &str) -> Result<usize, AgentCertError> {
    Ok(encoder()?.encode_with_special_tokens(text).len())
}

/// Estimate over the canonical (sorted-key, compact) JSON form of `value`.
pub fn estimate_json<T: Serialize>(value: &T) -> Result<usize, AgentCertError> {
    let bytes = integrity::canonical_json_bytes(value)?;
    let text = String::from_utf8(bytes)
        .map_err(|e| AgentCertError::ValidationError(format!("canonical JSON is not UTF-8: {}", e)))?;
    estimate_tokens(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_deterministic() {
        let text = "Plan: gather sources, summarize findings, cite everything.";
        assert_eq!(estimate_tokens(text).unwrap(), estimate_tokens(text).unwrap());
        assert!(estimate_tokens(text).unwrap() > 0);
        assert_eq!(estimate_tokens("").unwrap(), 0);
    }

    #[test]
    fn test_estimate_json_ignores_key_order() {
        let a = serde_json::json!({"goal": "triage", "steps": [1, 2, 3]});
        let b: serde_json::Value = serde_json::from_str(r#"{"steps":[1,2,3],"goal":"triage"}"#).unwrap();
        assert_eq!(estimate_json(&a).unwrap(), estimate_json(&b).unwrap());
    }
}
