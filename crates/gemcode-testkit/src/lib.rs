//! Test doubles shared by the agent and CLI test suites.

use anyhow::{Result, anyhow};
use gemcode_core::{FunctionDeclaration, Message, ModelTurn, TokenUsage, ToolCallRequest};
use gemcode_llm::ModelClient;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Token counts used by every canned turn.
pub const FAKE_PROMPT_TOKENS: u64 = 42;
pub const FAKE_RESPONSE_TOKENS: u64 = 17;

/// Build a terminal turn: text only, no tool calls.
pub fn text_turn(text: &str) -> ModelTurn {
    ModelTurn {
        text: Some(text.to_string()),
        tool_calls: vec![],
        usage: Some(fake_usage()),
    }
}

/// Build a turn requesting one tool call.
pub fn call_turn(name: &str, args: Value) -> ModelTurn {
    let args = match args {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    ModelTurn {
        text: None,
        tool_calls: vec![ToolCallRequest {
            name: name.to_string(),
            args,
        }],
        usage: Some(fake_usage()),
    }
}

/// Build a turn whose usage metadata is missing, which the loop must treat
/// as a malformed response.
pub fn malformed_turn(text: &str) -> ModelTurn {
    ModelTurn {
        text: Some(text.to_string()),
        tool_calls: vec![],
        usage: None,
    }
}

pub fn fake_usage() -> TokenUsage {
    TokenUsage {
        prompt_tokens: FAKE_PROMPT_TOKENS,
        response_tokens: FAKE_RESPONSE_TOKENS,
    }
}

enum Scripted {
    Turn(ModelTurn),
    Fault(String),
}

/// Model client that replays a fixed script of turns, recording the history
/// it was handed at each call.
pub struct ScriptedModelClient {
    script: Mutex<Vec<Scripted>>,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModelClient {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().map(Scripted::Turn).collect()),
            histories: Mutex::new(Vec::new()),
        }
    }

    /// Append a transport-style fault at the end of the current script.
    pub fn push_fault(&self, message: &str) {
        self.script
            .lock()
            .expect("script")
            .push(Scripted::Fault(message.to_string()));
    }

    /// Append one more turn at the end of the current script.
    pub fn push_turn(&self, turn: ModelTurn) {
        self.script.lock().expect("script").push(Scripted::Turn(turn));
    }

    /// Number of model calls made so far.
    pub fn calls(&self) -> usize {
        self.histories.lock().expect("histories").len()
    }

    /// The conversation history snapshot taken at call `index`.
    pub fn history_at(&self, index: usize) -> Vec<Message> {
        self.histories.lock().expect("histories")[index].clone()
    }
}

impl ModelClient for ScriptedModelClient {
    fn generate_turn(
        &self,
        history: &[Message],
        _tools: &[FunctionDeclaration],
        _system_instruction: &str,
    ) -> Result<ModelTurn> {
        self.histories
            .lock()
            .expect("histories")
            .push(history.to_vec());
        let mut script = self.script.lock().expect("script");
        if script.is_empty() {
            return Err(anyhow!("scripted client exhausted after {} calls", self.calls()));
        }
        match script.remove(0) {
            Scripted::Turn(turn) => Ok(turn),
            Scripted::Fault(message) => Err(anyhow!(message)),
        }
    }
}

/// A throwaway workspace directory seeded with a small Python project, the
/// shape the canned exploration script expects.
pub struct TestWorkspace {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("calculator");
        fs::create_dir_all(root.join("pkg"))?;
        fs::write(
            root.join("main.py"),
            "from pkg.render import format_json_output\n\nprint(format_json_output('3 + 5', 8))\n",
        )?;
        fs::write(
            root.join("pkg/render.py"),
            "def format_json_output(expression, result):\n    return f'{{\"expression\": \"{expression}\", \"result\": {result}}}'\n",
        )?;
        Ok(Self { _dir: dir, root })
    }
}

/// The canned three-round exploration: list the workspace, read `main.py`,
/// then answer in plain text.
pub fn exploration_script(final_text: &str) -> Vec<ModelTurn> {
    vec![
        call_turn("list_directory", serde_json::json!({"path": "."})),
        call_turn("read_file", serde_json::json!({"path": "main.py"})),
        text_turn(final_text),
    ]
}
