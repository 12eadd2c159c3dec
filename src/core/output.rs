//! Operator-facing warnings and their terminal rendering.

use colored::Colorize;
use serde::Serialize;

/// A non-fatal condition surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

pub fn print_warnings(warnings: &[Warning]) {
    for w in warnings {
        eprintln!(
            "  {} {} {}",
            "⚠".bright_yellow().bold(),
            format!("[{}]", w.code).bright_yellow(),
            compact_line(&w.message, 160)
        );
    }
}
