//! Pipeline artifacts as explicit states.
//!
//! A document on disk is classified once into [`ArtifactState`]; after that
//! "is this certified" is answered by the variant, and the compiler only
//! accepts the typed [`CertifiedArtifact`]. Every artifact keeps its
//! `metadata` object as the last key.
//!
//! Digests are SHA-256 over the canonical (sorted-key, compact) JSON with the
//! `sha256` and `signature` fields absent. Signatures cover the digest, with
//! a per-stage domain prefix.

use crate::core::error::AgentCertError;
use crate::core::identity::Identity;
use crate::core::integrity;
use crate::core::signing::{self, SignatureDomain};
use crate::core::time::Timestamp;
use crate::core::tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: &str = "1.0.0";
pub const GENERATOR: &str = concat!("agentcert ", env!("CARGO_PKG_VERSION"));
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PREVIEW_FORMAT: &str = "agentcert.preview";
pub const CERTIFIED_FORMAT: &str = "agentcert.certified";
pub const COMPILED_FORMAT: &str = "agentcert.compiled";

/// Where one section of the preview came from, plus the transport-only keys
/// (`cliVersion`, `schemaVersion`, `createdVia`) lifted out of its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVersion {
    pub id: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transport: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerBlock {
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

/// Everything the token estimate and the preview digest are computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBody {
    pub agent: Value,
    pub plan: Value,
    pub criteria: Value,
    pub conventions: Value,
    pub owner: OwnerBlock,
    pub previewer: Identity,
    pub source_versions: BTreeMap<String, SourceVersion>,
    pub section_tokens: BTreeMap<String, usize>,
}

impl PreviewBody {
    pub fn estimate_tokens(&self) -> Result<usize, AgentCertError> {
        tokens::estimate_json(self)
    }

    pub fn digest(&self) -> Result<String, AgentCertError> {
        integrity::canonical_hash_hex(self)
    }

    /// Agent id and birth timestamp, `<agent>@<birth>`.
    pub fn lineage(&self) -> Result<String, AgentCertError> {
        let agent = self.source_versions.get("agent").ok_or_else(|| {
            AgentCertError::ValidationError("sourceVersions.agent missing".to_string())
        })?;
        Ok(format!("{}@{}", agent.id, agent.timestamp))
    }

    pub fn agent_id(&self) -> Result<&str, AgentCertError> {
        self.source_versions
            .get("agent")
            .map(|a| a.id.as_str())
            .ok_or_else(|| AgentCertError::ValidationError("sourceVersions.agent missing".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewMetadata {
    pub format: String,
    pub schema: String,
    pub generator: String,
    pub generated_at: String,
    pub previewer_fingerprint: String,
    pub previewer_key_version: Timestamp,
    pub sha256: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewArtifact {
    #[serde(flatten)]
    pub body: PreviewBody,
    pub estimated_tokens: usize,
    pub metadata: PreviewMetadata,
}

impl PreviewArtifact {
    /// Previewer block, fingerprint and signature must all agree.
    pub fn verify_previewer(&self) -> Result<(), AgentCertError> {
        check_identity_block(&self.body.previewer, &self.metadata.previewer_fingerprint)?;
        signing::verify_digest(
            &self.body.previewer.public_key,
            SignatureDomain::Preview,
            &self.metadata.sha256,
            &self.metadata.signature,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificationMetadata {
    pub format: String,
    pub schema: String,
    pub generator: String,
    pub tool_version: String,
    pub generated_at: String,
    pub experimental: bool,
    pub valid_from: String,
    pub valid_until: String,
    pub preview_sha256: String,
    pub previewer_signature: String,
    pub previewer_fingerprint: String,
    pub certifier_fingerprint: String,
    pub certifier_key_version: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifiedArtifact {
    #[serde(flatten)]
    pub body: PreviewBody,
    pub estimated_tokens: usize,
    pub certifier: Identity,
    pub metadata: CertificationMetadata,
}

impl CertifiedArtifact {
    /// Digest with `metadata.sha256` and `metadata.signature` absent.
    pub fn digest(&self) -> Result<String, AgentCertError> {
        let mut unsigned = self.clone();
        unsigned.metadata.sha256 = None;
        unsigned.metadata.signature = None;
        integrity::canonical_hash_hex(&unsigned)
    }

    pub fn sha256(&self) -> Result<&str, AgentCertError> {
        self.metadata
            .sha256
            .as_deref()
            .ok_or_else(|| AgentCertError::IntegrityMismatch("certified artifact has no sha256".to_string()))
    }

    /// Re-derive every link of the chain: preview digest and previewer
    /// signature, then the certification digest and certifier signature.
    pub fn verify(&self) -> Result<(), AgentCertError> {
        let body_digest = self.body.digest()?;
        if body_digest != self.metadata.preview_sha256 {
            return Err(AgentCertError::IntegrityMismatch(format!(
                "preview content digest {} does not match recorded {}",
                body_digest, self.metadata.preview_sha256
            )));
        }
        check_identity_block(&self.body.previewer, &self.metadata.previewer_fingerprint)?;
        signing::verify_digest(
            &self.body.previewer.public_key,
            SignatureDomain::Preview,
            &self.metadata.preview_sha256,
            &self.metadata.previewer_signature,
        )?;

        let stored = self.sha256()?;
        let recomputed = self.digest()?;
        if recomputed != stored {
            return Err(AgentCertError::IntegrityMismatch(format!(
                "certified digest {} does not match recorded {}",
                recomputed, stored
            )));
        }
        check_identity_block(&self.certifier, &self.metadata.certifier_fingerprint)?;
        if self.certifier.key_version != self.metadata.certifier_key_version {
            return Err(AgentCertError::IntegrityMismatch(
                "certifier key version differs from metadata".to_string(),
            ));
        }
        let signature = self.metadata.signature.as_deref().ok_or_else(|| {
            AgentCertError::SignatureInvalid("certified artifact is unsigned".to_string())
        })?;
        signing::verify_digest(&self.certifier.public_key, SignatureDomain::Certify, stored, signature)
    }
}

/// Superset of [`CertificationMetadata`]: the certification fields stay at
/// the top level so a compiled bundle still satisfies [`is_certified`]. The
/// certifier's own header, digest and signature move to `certified*` keys,
/// freeing `format`, `sha256` and `signature` for the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationMetadata {
    pub format: String,
    pub schema: String,
    pub generator: String,
    pub generated_at: String,
    pub tool_version: String,
    pub experimental: bool,
    pub valid_from: String,
    pub valid_until: String,
    pub preview_sha256: String,
    pub previewer_signature: String,
    pub previewer_fingerprint: String,
    pub certifier_fingerprint: String,
    pub certifier_key_version: Timestamp,
    pub certified_format: String,
    pub certified_schema: String,
    pub certified_generator: String,
    pub certified_at: String,
    pub certified_sha256: String,
    pub certifier_signature: String,
    pub version: String,
    pub compiler_fingerprint: String,
    pub compiler_key_version: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl CompilationMetadata {
    /// Unsigned compilation metadata carrying `certification` forward.
    pub fn from_certified(
        certification: CertificationMetadata,
        version: String,
        generated_at: String,
        compiler: &Identity,
    ) -> Result<Self, AgentCertError> {
        let certified_sha256 = certification.sha256.ok_or_else(|| {
            AgentCertError::IntegrityMismatch("certified artifact has no sha256".to_string())
        })?;
        let certifier_signature = certification.signature.ok_or_else(|| {
            AgentCertError::SignatureInvalid("certified artifact is unsigned".to_string())
        })?;
        Ok(CompilationMetadata {
            format: COMPILED_FORMAT.to_string(),
            schema: SCHEMA_VERSION.to_string(),
            generator: GENERATOR.to_string(),
            generated_at,
            tool_version: certification.tool_version,
            experimental: certification.experimental,
            valid_from: certification.valid_from,
            valid_until: certification.valid_until,
            preview_sha256: certification.preview_sha256,
            previewer_signature: certification.previewer_signature,
            previewer_fingerprint: certification.previewer_fingerprint,
            certifier_fingerprint: certification.certifier_fingerprint,
            certifier_key_version: certification.certifier_key_version,
            certified_format: certification.format,
            certified_schema: certification.schema,
            certified_generator: certification.generator,
            certified_at: certification.generated_at,
            certified_sha256,
            certifier_signature,
            version,
            compiler_fingerprint: compiler.fingerprint.clone(),
            compiler_key_version: compiler.key_version.clone(),
            sha256: None,
            signature: None,
        })
    }

    /// The certified stage's metadata exactly as the certifier signed it.
    pub fn certification(&self) -> CertificationMetadata {
        CertificationMetadata {
            format: self.certified_format.clone(),
            schema: self.certified_schema.clone(),
            generator: self.certified_generator.clone(),
            tool_version: self.tool_version.clone(),
            generated_at: self.certified_at.clone(),
            experimental: self.experimental,
            valid_from: self.valid_from.clone(),
            valid_until: self.valid_until.clone(),
            preview_sha256: self.preview_sha256.clone(),
            previewer_signature: self.previewer_signature.clone(),
            previewer_fingerprint: self.previewer_fingerprint.clone(),
            certifier_fingerprint: self.certifier_fingerprint.clone(),
            certifier_key_version: self.certifier_key_version.clone(),
            sha256: Some(self.certified_sha256.clone()),
            signature: Some(self.certifier_signature.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledBundle {
    #[serde(flatten)]
    pub body: PreviewBody,
    pub estimated_tokens: usize,
    pub certifier: Identity,
    pub compiler: Identity,
    pub compiled_at: String,
    pub global_byo: Value,
    pub metadata: CompilationMetadata,
}

impl CompiledBundle {
    pub fn digest(&self) -> Result<String, AgentCertError> {
        let mut unsigned = self.clone();
        unsigned.metadata.sha256 = None;
        unsigned.metadata.signature = None;
        integrity::canonical_hash_hex(&unsigned)
    }

    /// The certified artifact this bundle was compiled from, exactly as it
    /// was signed.
    pub fn certified_view(&self) -> CertifiedArtifact {
        CertifiedArtifact {
            body: self.body.clone(),
            estimated_tokens: self.estimated_tokens,
            certifier: self.certifier.clone(),
            metadata: self.metadata.certification(),
        }
    }

    pub fn verify(&self) -> Result<(), AgentCertError> {
        self.certified_view().verify()?;
        let stored = self.metadata.sha256.as_deref().ok_or_else(|| {
            AgentCertError::IntegrityMismatch("compiled bundle has no sha256".to_string())
        })?;
        let recomputed = self.digest()?;
        if recomputed != stored {
            return Err(AgentCertError::IntegrityMismatch(format!(
                "compiled digest {} does not match recorded {}",
                recomputed, stored
            )));
        }
        check_identity_block(&self.compiler, &self.metadata.compiler_fingerprint)?;
        let signature = self.metadata.signature.as_deref().ok_or_else(|| {
            AgentCertError::SignatureInvalid("compiled bundle is unsigned".to_string())
        })?;
        signing::verify_digest(&self.compiler.public_key, SignatureDomain::Compile, stored, signature)
    }
}

/// Fingerprint must equal both the hash of the embedded public key and the
/// fingerprint recorded in metadata.
fn check_identity_block(identity: &Identity, recorded: &str) -> Result<(), AgentCertError> {
    let key = signing::decode_verifying_key(&identity.public_key)?;
    let derived = signing::fingerprint(key.as_bytes());
    if derived != identity.fingerprint || derived != recorded {
        return Err(AgentCertError::SignatureInvalid(format!(
            "{} '{}' fingerprint does not match its public key",
            identity.role, identity.name
        )));
    }
    Ok(())
}

/// Everything in a preview document except `estimatedTokens` and `metadata`.
pub fn raw_body(document: &Value) -> Value {
    match document.as_object() {
        Some(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "estimatedTokens" && k.as_str() != "metadata")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => document.clone(),
    }
}

/// Re-estimate and re-hash the body of a preview document as it sits on
/// disk. Works on the raw JSON so keys added after generation are caught
/// too.
pub fn check_preview_drift(document: &Value) -> Result<(), AgentCertError> {
    let stored = document
        .get("estimatedTokens")
        .and_then(Value::as_u64)
        .ok_or_else(|| AgentCertError::UncertifiablePreview("estimatedTokens missing".to_string()))?
        as usize;
    let body = raw_body(document);
    let recomputed = tokens::estimate_json(&body)?;
    let digest_changed = document
        .get("metadata")
        .and_then(|m| m.get("sha256"))
        .and_then(Value::as_str)
        .is_some_and(|stored_digest| {
            !integrity::canonical_hash_hex(&body).is_ok_and(|d| d == stored_digest)
        });
    if recomputed != stored || digest_changed {
        return Err(AgentCertError::TokenDrift {
            stored,
            recomputed,
            digest_changed,
        });
    }
    Ok(())
}

/// Digest of a signed document as it sits on disk, with `metadata.sha256`
/// and `metadata.signature` removed. Must equal the recorded `sha256`.
pub fn check_unsigned_digest(document: &Value) -> Result<String, AgentCertError> {
    let mut unsigned = document.clone();
    let recorded = match unsigned.get_mut("metadata").and_then(Value::as_object_mut) {
        Some(meta) => {
            meta.remove("signature");
            meta.remove("sha256").and_then(|v| v.as_str().map(str::to_string))
        }
        None => None,
    };
    let recorded = recorded
        .ok_or_else(|| AgentCertError::IntegrityMismatch("metadata.sha256 missing".to_string()))?;
    let recomputed = integrity::canonical_hash_hex(&unsigned)?;
    if recomputed != recorded {
        return Err(AgentCertError::IntegrityMismatch(format!(
            "content digest {} does not match recorded {}",
            recomputed, recorded
        )));
    }
    Ok(recorded)
}

/// Raw certification predicate: certifier block and certifier key version
/// both present.
pub fn is_certified(value: &Value) -> bool {
    let present = |v: Option<&Value>| v.is_some_and(|v| !v.is_null());
    present(value.get("certifier"))
        && present(value.get("metadata").and_then(|m| m.get("certifierKeyVersion")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactState {
    Draft(Value),
    Previewed(Box<PreviewArtifact>),
    Certified(Box<CertifiedArtifact>),
    Compiled(Box<CompiledBundle>),
}

impl ArtifactState {
    pub fn classify(value: Value) -> Result<Self, AgentCertError> {
        let present = |key: &str| value.get(key).is_some_and(|v| !v.is_null());
        let meta_has = |key: &str| {
            value
                .get("metadata")
                .and_then(|m| m.get(key))
                .is_some_and(|v| !v.is_null())
        };
        let malformed = |stage: &str, e: serde_json::Error| {
            AgentCertError::ValidationError(format!("malformed {} artifact: {}", stage, e))
        };

        if present("compiler") && meta_has("version") && meta_has("certifiedSha256") {
            let bundle = serde_json::from_value(value).map_err(|e| malformed("compiled", e))?;
            return Ok(ArtifactState::Compiled(Box::new(bundle)));
        }
        if is_certified(&value) {
            let certified = serde_json::from_value(value).map_err(|e| malformed("certified", e))?;
            return Ok(ArtifactState::Certified(Box::new(certified)));
        }
        if present("previewer") && present("estimatedTokens") && meta_has("signature") {
            let preview = serde_json::from_value(value).map_err(|e| malformed("preview", e))?;
            return Ok(ArtifactState::Previewed(Box::new(preview)));
        }
        Ok(ArtifactState::Draft(value))
    }

    pub fn stage(&self) -> &'static str {
        match self {
            ArtifactState::Draft(_) => "draft",
            ArtifactState::Previewed(_) => "previewed",
            ArtifactState::Certified(_) => "certified",
            ArtifactState::Compiled(_) => "compiled",
        }
    }

    pub fn is_certified(&self) -> bool {
        matches!(self, ArtifactState::Certified(_) | ArtifactState::Compiled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_certified_requires_both_fields() {
        assert!(!is_certified(&json!({"certifier": {"name": "c"}})));
        assert!(!is_certified(&json!({"metadata": {"certifierKeyVersion": "x"}})));
        assert!(!is_certified(&json!({"certifier": null, "metadata": {"certifierKeyVersion": "x"}})));
        assert!(is_certified(&json!({"certifier": {}, "metadata": {"certifierKeyVersion": "x"}})));
    }

    #[test]
    fn test_raw_body_drops_signals() {
        let doc = json!({"agent": {}, "estimatedTokens": 3, "metadata": {}});
        assert_eq!(raw_body(&doc), json!({"agent": {}}));
    }

    #[test]
    fn test_drift_detects_added_key() {
        let body = json!({"agent": {"name": "scout"}});
        let mut doc = body.clone();
        doc["estimatedTokens"] = json!(tokens::estimate_json(&body).unwrap());
        doc["metadata"] = json!({"sha256": integrity::canonical_hash_hex(&body).unwrap()});
        check_preview_drift(&doc).unwrap();

        doc["agent"]["name"] = json!("scout!");
        assert!(matches!(
            check_preview_drift(&doc),
            Err(AgentCertError::TokenDrift { .. })
        ));
    }

    #[test]
    fn test_digest_only_drift_is_flagged() {
        let body = json!({"agent": {"name": "scout"}, "plan": {"steps": [1, 2]}});
        let tokens = tokens::estimate_json(&body).unwrap();
        let mut doc = body.clone();
        doc["estimatedTokens"] = json!(tokens);
        doc["metadata"] = json!({"sha256": integrity::sha256_hex(b"some other body")});
        match check_preview_drift(&doc) {
            Err(AgentCertError::TokenDrift {
                stored,
                recomputed,
                digest_changed,
            }) => {
                assert_eq!(stored, recomputed);
                assert!(digest_changed);
            }
            other => panic!("expected digest drift, got {:?}", other),
        }
    }

    #[test]
    fn test_unsigned_digest_ignores_signature_fields() {
        let unsigned = json!({"a": 1, "metadata": {"format": "x"}});
        let digest = integrity::canonical_hash_hex(&unsigned).unwrap();
        let mut doc = unsigned.clone();
        doc["metadata"]["sha256"] = json!(digest.clone());
        doc["metadata"]["signature"] = json!("00");
        assert_eq!(check_unsigned_digest(&doc).unwrap(), digest);

        doc["a"] = json!(2);
        assert!(matches!(
            check_unsigned_digest(&doc),
            Err(AgentCertError::IntegrityMismatch(_))
        ));
    }

    #[test]
    fn test_classify_falls_back_to_draft() {
        let state = ArtifactState::classify(json!({"agent": {"name": "scout"}})).unwrap();
        assert_eq!(state.stage(), "draft");
        assert!(!state.is_certified());
    }

    #[test]
    fn test_classify_rejects_malformed_certified() {
        let err = ArtifactState::classify(json!({
            "certifier": {"name": "c"},
            "metadata": {"certifierKeyVersion": "20260101T000000000Z"}
        }))
        .unwrap_err();
        assert!(matches!(err, AgentCertError::ValidationError(_)));
    }
}
