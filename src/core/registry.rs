//! Built-in model registry, embedded from `registry/models.toml`.

use crate::core::error::AgentCertError;
use crate::core::output::Warning;
use rust_embed::RustEmbed;
use serde::Deserialize;

#[derive(RustEmbed)]
#[folder = "registry/"]
#[include = "*.toml"]
struct RegistryAssets;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelLimits {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub context_tokens: usize,
    pub ideal_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRegistry {
    #[serde(rename = "model")]
    pub models: Vec<ModelLimits>,
}

impl ModelRegistry {
    pub fn builtin() -> Result<Self, AgentCertError> {
        let file = RegistryAssets::get("models.toml").ok_or_else(|| {
            AgentCertError::NotFound("embedded registry/models.toml".to_string())
        })?;
        let content = std::str::from_utf8(&file.data).map_err(|e| {
            AgentCertError::ValidationError(format!("model registry is not UTF-8: {}", e))
        })?;
        Ok(toml::from_str(content)?)
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelLimits> {
        let wanted = model.trim().to_ascii_lowercase();
        self.models.iter().find(|m| {
            m.id.eq_ignore_ascii_case(&wanted) || m.aliases.iter().any(|a| a.eq_ignore_ascii_case(&wanted))
        })
    }

    /// Non-fatal budget findings for a bundle of `tokens` aimed at `model`.
    pub fn budget_warnings(&self, model: Option<&str>, tokens: usize) -> Vec<Warning> {
        let Some(model) = model else {
            return vec![Warning::new(
                "budget.no-target-model",
                "conventions declare no targetModel; token budget not checked",
            )];
        };
        let Some(limits) = self.lookup(model) else {
            return vec![Warning::new(
                "budget.unknown-model",
                format!("model '{}' is not in the registry; token budget not checked", model),
            )];
        };
        let mut out = Vec::new();
        if tokens > limits.context_tokens {
            out.push(Warning::new(
                "budget.context-exceeded",
                format!(
                    "{} tokens exceed the {} context window of {} tokens",
                    tokens, limits.id, limits.context_tokens
                ),
            ));
        } else if tokens > limits.ideal_tokens {
            out.push(Warning::new(
                "budget.ideal-exceeded",
                format!(
                    "{} tokens exceed the ideal budget of {} tokens for {}",
                    tokens, limits.ideal_tokens, limits.id
                ),
            ));
        }
        out
    }
}
