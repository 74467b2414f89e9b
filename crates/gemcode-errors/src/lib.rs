//! User-facing error presentation for the gemcode CLI.
//!
//! Internal errors stay as plain `anyhow` chains; this module classifies
//! them at the CLI boundary and adds recovery suggestions.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error enriched with a title and recovery suggestions for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ErrorType {
    /// Missing API key, unreadable settings.
    Configuration,
    /// Timeouts and connection failures talking to the model.
    Network,
    /// Paths escaping the working directory, invalid sandbox root.
    Sandbox,
    /// Loop aborts and tool failures.
    Runtime,
    /// Anything not matched above.
    Unknown,
}

impl EnhancedError {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut output = String::new();
        output.push_str(&format!("{}: {}\n", self.error_type.emoji(), self.title));
        output.push_str(&format!("  {}\n", self.message));

        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }

        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        output
    }
}

impl ErrorType {
    pub fn emoji(&self) -> &'static str {
        match self {
            ErrorType::Configuration => "🔧",
            ErrorType::Network => "🌐",
            ErrorType::Sandbox => "🔒",
            ErrorType::Runtime => "⚡",
            ErrorType::Unknown => "❓",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

/// Classifies errors at the CLI boundary and renders them for the terminal.
pub struct ErrorHandler {
    verbose: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        if let Some(enhanced) = error.downcast_ref::<EnhancedError>() {
            return enhanced.format(self.verbose);
        }
        let error_str = error.to_string();
        self.classify_error(&error_str).format(self.verbose)
    }

    fn classify_error(&self, error_message: &str) -> EnhancedError {
        let lower_error = error_message.to_lowercase();

        if lower_error.contains("api key") || lower_error.contains("gemini_api_key") {
            return EnhancedError::new(
                "Configuration Error",
                error_message,
                ErrorType::Configuration,
            )
            .with_suggestions(vec![
                "Set the GEMINI_API_KEY environment variable".to_string(),
                "Get an API key at https://aistudio.google.com/apikey".to_string(),
            ]);
        }

        if lower_error.contains("network")
            || lower_error.contains("timeout")
            || lower_error.contains("timed out")
            || lower_error.contains("connection")
            || lower_error.contains("dns")
        {
            return EnhancedError::new("Network Error", error_message, ErrorType::Network)
                .with_suggestions(vec![
                    "Check your internet connection".to_string(),
                    "Verify the API endpoint is accessible".to_string(),
                    "Try again in a few moments".to_string(),
                ]);
        }

        if lower_error.contains("outside the permitted working directory")
            || lower_error.contains("sandbox root")
        {
            return EnhancedError::new("Sandbox Error", error_message, ErrorType::Sandbox)
                .with_suggestions(vec![
                    "Use paths relative to the working directory".to_string(),
                    "Pass --sandbox-root to point at a different directory".to_string(),
                ]);
        }

        if lower_error.contains("no final response") {
            return EnhancedError::new("Agent Aborted", error_message, ErrorType::Runtime)
                .with_suggestions(vec![
                    "Raise the limit with --max-rounds".to_string(),
                    "Break the request into smaller steps".to_string(),
                ]);
        }

        EnhancedError::new("Error", error_message, ErrorType::Unknown)
            .with_suggestion("Re-run with --verbose for more detail".to_string())
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Common error constructors for frequently encountered errors.
pub mod errors {
    use super::*;

    pub fn missing_api_key(env_var: &str) -> EnhancedError {
        EnhancedError::new(
            "Missing API Key",
            format!("{env_var} is required to talk to the Gemini API."),
            ErrorType::Configuration,
        )
        .with_suggestions(vec![
            format!("Set the {env_var} environment variable"),
            "Get an API key at https://aistudio.google.com/apikey".to_string(),
        ])
    }

    pub fn invalid_sandbox_root(path: &str) -> EnhancedError {
        EnhancedError::new(
            "Invalid Working Directory",
            format!("'{path}' does not exist or is not a directory."),
            ErrorType::Sandbox,
        )
        .with_suggestions(vec![
            "Check the --sandbox-root path".to_string(),
            "Create the directory before running".to_string(),
        ])
    }
}
