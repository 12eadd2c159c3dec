//! Static pattern scanner run over source directories before a preview.
//!
//! The scanner is a collaborator behind the [`Scanner`] trait; the pipeline
//! only consumes its issue list. [`PatternScanner`] is the built-in
//! denylist/allowlist implementation.

use crate::core::error::AgentCertError;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanIssue {
    pub file: String,
    pub line: usize,
    pub pattern: String,
    pub severity: Severity,
}

pub trait Scanner: Send + Sync {
    fn scan(&self, roots: &[PathBuf]) -> Result<Vec<ScanIssue>, AgentCertError>;
}

struct DenyRule {
    name: &'static str,
    regex: Regex,
    severity: Severity,
}

pub struct PatternScanner {
    deny: Vec<DenyRule>,
    allow: Vec<Regex>,
}

const DEFAULT_DENY: &[(&str, &str, Severity)] = &[
    ("private-key-block", r"-----BEGIN [A-Z ]*PRIVATE KEY-----", Severity::Critical),
    ("aws-access-key", r"\bAKIA[0-9A-Z]{16}\b", Severity::Critical),
    ("api-token", r#"(?i)\b(api[_-]?key|secret|token)\b["']?\s*[:=]\s*["'][A-Za-z0-9_\-]{16,}["']"#, Severity::High),
    ("prompt-override", r"(?i)ignore (all )?previous instructions", Severity::High),
    ("destructive-shell", r"rm\s+-rf\s+/(\s|$)", Severity::High),
    ("pipe-to-shell", r"(?i)(curl|wget)[^|\n]*\|\s*(sudo\s+)?(ba)?sh\b", Severity::Medium),
    ("plaintext-password", r#"(?i)\bpassword\b["']?\s*[:=]\s*["'][^"']+["']"#, Severity::Medium),
];

impl PatternScanner {
    pub fn with_defaults() -> Result<Self, AgentCertError> {
        Self::new(DEFAULT_DENY, &[])
    }

    pub fn new(deny: &[(&'static str, &str, Severity)], allow: &[&str]) -> Result<Self, AgentCertError> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| AgentCertError::ValidationError(format!("bad scan pattern '{}': {}", p, e)))
        };
        let deny = deny
            .iter()
            .map(|&(name, pattern, severity)| {
                Ok(DenyRule {
                    name,
                    regex: compile(pattern)?,
                    severity,
                })
            })
            .collect::<Result<Vec<_>, AgentCertError>>()?;
        let allow = allow.iter().map(|p| compile(*p)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { deny, allow })
    }

    fn scan_file(&self, path: &Path) -> Vec<ScanIssue> {
        // Unreadable or non-UTF-8 files are skipped.
        let Ok(content) = fs::read_to_string(path) else {
            return Vec::new();
        };
        let mut issues = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if self.allow.iter().any(|a| a.is_match(line)) {
                continue;
            }
            for rule in &self.deny {
                if rule.regex.is_match(line) {
                    issues.push(ScanIssue {
                        file: path.to_string_lossy().to_string(),
                        line: idx + 1,
                        pattern: rule.name.to_string(),
                        severity: rule.severity,
                    });
                }
            }
        }
        issues
    }
}

impl Scanner for PatternScanner {
    fn scan(&self, roots: &[PathBuf]) -> Result<Vec<ScanIssue>, AgentCertError> {
        let mut files = Vec::new();
        for root in roots {
            collect_files(root, &mut files)?;
        }
        files.sort();
        files.dedup();
        let mut issues: Vec<ScanIssue> = files.par_iter().flat_map(|f| self.scan_file(f)).collect();
        issues.sort_by(|a, b| (&a.file, a.line, &a.pattern).cmp(&(&b.file, b.line, &b.pattern)));
        Ok(issues)
    }
}

/// Regular files under `root`. Symlinks are not followed, which also keeps
/// alias links from scanning a version twice.
fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), AgentCertError> {
    let meta = match fs::symlink_metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_file() {
        out.push(root.to_path_buf());
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        collect_files(&entry?.path(), out)?;
    }
    Ok(())
}
