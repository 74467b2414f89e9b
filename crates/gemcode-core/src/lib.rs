use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

/// Gemini model alias used when no override is configured.
pub const GEMINI_FLASH_MODEL: &str = "gemini-2.5-flash";

pub fn runtime_dir(sandbox_root: &Path) -> PathBuf {
    sandbox_root.join(".gemcode")
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// One piece of a message: plain text, a tool-call request issued by the
/// model, or the response produced for one of those requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        name: String,
        args: serde_json::Map<String, serde_json::Value>,
    },
    FunctionResponse {
        name: String,
        response: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a success response payload: `{"result": <output>}`.
    pub fn function_result(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionResponse {
            name: name.into(),
            response: serde_json::json!({"result": output.into()}),
        }
    }

    /// Build an error response payload: `{"error": <description>}`.
    pub fn function_error(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::FunctionResponse {
            name: name.into(),
            response: serde_json::json!({"error": description.into()}),
        }
    }

    /// A FunctionResponse carries exactly one of `result` or `error`.
    /// Anything else is a malformed part the loop must not append.
    pub fn is_well_formed_response(&self) -> bool {
        match self {
            Self::FunctionResponse { response, .. } => {
                let has_result = response.get("result").is_some();
                let has_error = response.get("error").is_some();
                has_result != has_error
            }
            _ => false,
        }
    }
}

/// One turn in the conversation history sent back to the model each round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    pub fn tool(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Tool,
            parts,
        }
    }
}

/// A tool invocation requested by the model. The sandbox root is never part
/// of `args` — the dispatcher injects it immediately before invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Token accounting reported by the model for a single round. Informational
/// only, but its absence marks the whole response as malformed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.response_tokens = self.response_tokens.saturating_add(other.response_tokens);
    }
}

/// The model's single response within one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTurn {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

impl ModelTurn {
    /// A turn with no tool calls and non-empty text ends the loop.
    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty() && self.text.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Schema for one tool, serialized into the request so the model knows what
/// it may call. Documentation for the model, not a security boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: GEMINI_FLASH_MODEL.to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 2,
            retry_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum rounds (model calls) before the loop aborts.
    pub max_rounds: u64,
    /// Replaces the built-in system instruction when non-empty.
    pub system_instruction: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            system_instruction: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Character budget for read_file before truncation.
    pub read_max_chars: usize,
    /// Wall-clock timeout for execute_script subprocesses.
    pub script_timeout_seconds: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            read_max_chars: 10_000,
            script_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".gemcode/settings.json"))
    }

    pub fn project_settings_path(sandbox_root: &Path) -> PathBuf {
        runtime_dir(sandbox_root).join("settings.json")
    }

    pub fn project_local_settings_path(sandbox_root: &Path) -> PathBuf {
        runtime_dir(sandbox_root).join("settings.local.json")
    }

    pub fn legacy_toml_path(sandbox_root: &Path) -> PathBuf {
        runtime_dir(sandbox_root).join("config.toml")
    }

    /// Layered load: defaults, then legacy TOML, then user settings, project
    /// settings, and project-local settings, each deep-merged over the last.
    pub fn load(sandbox_root: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(sandbox_root);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(sandbox_root));
        paths.push(Self::project_local_settings_path(sandbox_root));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, sandbox_root: &Path) -> Result<()> {
        let path = Self::project_settings_path(sandbox_root);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
