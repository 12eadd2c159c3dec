//! Ed25519 signing with per-stage domain separation.
//!
//! Every stage signs `"agentcert:<stage>:v1:" || sha256_hex`, so a signature
//! produced for one stage never verifies as another stage's signature.

use crate::core::error::AgentCertError;
use crate::core::identity::Identity;
use crate::core::integrity::sha256_hex;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureDomain {
    Preview,
    Certify,
    Compile,
}

impl SignatureDomain {
    pub fn prefix(self) -> &'static [u8] {
        match self {
            SignatureDomain::Preview => b"agentcert:preview:v1:",
            SignatureDomain::Certify => b"agentcert:certify:v1:",
            SignatureDomain::Compile => b"agentcert:compile:v1:",
        }
    }
}

fn domain_message(domain: SignatureDomain, digest_hex: &str) -> Vec<u8> {
    let prefix = domain.prefix();
    let mut message = Vec::with_capacity(prefix.len() + digest_hex.len());
    message.extend_from_slice(prefix);
    message.extend_from_slice(digest_hex.as_bytes());
    message
}

/// Fingerprint of a public key: lowercase hex SHA-256 of the raw key bytes.
pub fn fingerprint(public_key: &[u8]) -> String {
    sha256_hex(public_key)
}

pub fn decode_verifying_key(public_key_hex: &str) -> Result<VerifyingKey, AgentCertError> {
    let bytes = hex::decode(public_key_hex.trim())
        .map_err(|e| AgentCertError::KeyError(format!("public key is not hex: {}", e)))?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AgentCertError::KeyError(format!("public key must be 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| AgentCertError::KeyError(format!("invalid public key: {}", e)))
}

pub fn decode_signing_key(private_key_hex: &str) -> Result<SigningKey, AgentCertError> {
    let bytes = hex::decode(private_key_hex.trim())
        .map_err(|_| AgentCertError::KeyError("private key is not hex".to_string()))?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AgentCertError::KeyError("private key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&raw))
}

pub fn verify_digest(
    public_key_hex: &str,
    domain: SignatureDomain,
    digest_hex: &str,
    signature_hex: &str,
) -> Result<(), AgentCertError> {
    let key = decode_verifying_key(public_key_hex)?;
    let sig_bytes = hex::decode(signature_hex.trim())
        .map_err(|e| AgentCertError::SignatureInvalid(format!("signature is not hex: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| AgentCertError::SignatureInvalid(format!("malformed signature: {}", e)))?;
    key.verify(&domain_message(domain, digest_hex), &signature)
        .map_err(|_| {
            AgentCertError::SignatureInvalid(format!(
                "{:?} signature does not match key {}",
                domain,
                fingerprint(key.as_bytes())
            ))
        })
}

/// An unlocked identity able to sign. Key bytes stay in memory only.
pub struct Signer {
    key: SigningKey,
    identity: Identity,
    key_path: PathBuf,
}

impl Signer {
    pub(crate) fn new(key: SigningKey, identity: Identity, key_path: PathBuf) -> Result<Self, AgentCertError> {
        let public_hex = hex::encode(key.verifying_key().as_bytes());
        if public_hex != identity.public_key {
            return Err(AgentCertError::SignatureInvalid(format!(
                "private key at {} does not match public key of {} '{}'",
                key_path.display(),
                identity.role,
                identity.name
            )));
        }
        Ok(Self {
            key,
            identity,
            key_path,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn sign_digest(&self, domain: SignatureDomain, digest_hex: &str) -> String {
        let signature = self.key.sign(&domain_message(domain, digest_hex));
        hex::encode(signature.to_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("identity", &self.identity.name)
            .field("fingerprint", &self.identity.fingerprint)
            .finish_non_exhaustive()
    }
}
