//! Output formatting for the `--json` envelope (spec.md §6.1).
//!
//! Grounded on the teacher's `cli::output::OutputFormatter` — a small enum
//! dispatching to a JSON and a human renderer, built once from the global
//! `--json` flag and threaded through every command. The envelope shape
//! here is spec.md's `{success, data?, error?}`, not the teacher's
//! `{status, message, data}`, and the human side stays plain ASCII rather
//! than the teacher's emoji prefixes — this crate's newer modules read
//! soberly (see `tmux/mod.rs`, `store/mod.rs`).

use serde::Serialize;

use crate::error::NtmError;

/// Built once per invocation from `Cli::json` and threaded into every
/// command handler.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormatter {
    Json,
    Human,
}

pub fn create_formatter(json: bool) -> OutputFormatter {
    if json {
        OutputFormatter::Json
    } else {
        OutputFormatter::Human
    }
}

impl OutputFormatter {
    /// Renders a success result carrying structured `data`.
    pub fn success<T: Serialize>(&self, summary: &str, data: &T) -> String {
        match self {
            OutputFormatter::Json => {
                let envelope = serde_json::json!({ "success": true, "data": data });
                serde_json::to_string_pretty(&envelope)
                    .unwrap_or_else(|_| "{\"success\":true}".to_string())
            }
            OutputFormatter::Human => {
                let body = serde_json::to_string_pretty(data).unwrap_or_default();
                if body.is_empty() || body == "null" {
                    summary.to_string()
                } else {
                    format!("{summary}\n{body}")
                }
            }
        }
    }

    /// Renders a success result with no payload beyond the confirmation.
    pub fn success_message(&self, summary: &str) -> String {
        match self {
            OutputFormatter::Json => {
                serde_json::to_string_pretty(&serde_json::json!({ "success": true }))
                    .unwrap_or_else(|_| "{\"success\":true}".to_string())
            }
            OutputFormatter::Human => summary.to_string(),
        }
    }

    /// Renders an error per the `{success: false, error: {code, message,
    /// details?}}` shape (spec.md §6, §7).
    pub fn error(&self, err: &NtmError) -> String {
        match self {
            OutputFormatter::Json => {
                let envelope = serde_json::json!({ "success": false, "error": err });
                serde_json::to_string_pretty(&envelope)
                    .unwrap_or_else(|_| format!("{{\"success\":false,\"error\":\"{}\"}}", err.message))
            }
            OutputFormatter::Human => format!("error: {}", err.message),
        }
    }
}
