//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Text or JSON output of one-shot results

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};

use crate::core::transport::CommandOutput;
use clap::ValueEnum;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format for scripting
    Json,
}

/// Render a captured command result
pub fn format_command_output(output: &CommandOutput, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            let mut text = output.stdout.clone();
            if !output.stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&output.stderr);
            }
            text
        }
        OutputFormat::Json => serde_json::to_string(output).unwrap_or_default(),
    }
}
