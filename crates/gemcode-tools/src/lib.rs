mod sandbox;
mod script;

use anyhow::Result;
use gemcode_core::{FunctionDeclaration, Part, ToolCallRequest, ToolsConfig};
use gemcode_observe::Observer;
pub use sandbox::{PathSandbox, SandboxError};
pub use script::{PlatformScriptRunner, ScriptRunResult, ScriptRunner};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Reserved argument key owned by the dispatcher. The model never supplies
/// the sandbox root; if it tries, the dispatcher's value wins.
pub const WORKING_DIRECTORY_KEY: &str = "working_directory";

/// Everything a tool precondition or execution can fail with. All variants
/// are recovered by the dispatcher into error payloads — none escape as
/// faults.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Cannot {verb} \"{path}\" as it is outside the permitted working directory")]
    Containment { verb: &'static str, path: String },
    #[error("\"{path}\" is not a directory")]
    NotADirectory { path: String },
    #[error("File not found or is not a regular file: \"{path}\"")]
    NotAFile { path: String },
    #[error("File \"{path}\" not found.")]
    NotFound { path: String },
    #[error("\"{path}\" is not a Python file.")]
    NotAScript { path: String },
    #[error("missing required argument: {name}")]
    MissingArgument { name: &'static str },
    #[error("failed to start \"{path}\": {reason}")]
    SpawnFailed { path: String, reason: String },
    #[error("execution of \"{path}\" timed out after {seconds} seconds")]
    TimedOut { path: String, seconds: u64 },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Context handed to every tool handler. The sandbox root lives here, not in
/// the model-controlled argument map.
pub struct ToolContext<'a> {
    pub sandbox: &'a PathSandbox,
    pub cfg: &'a ToolsConfig,
    pub runner: &'a (dyn ScriptRunner + Send + Sync),
}

type ToolHandler = fn(&ToolContext<'_>, &serde_json::Map<String, Value>) -> Result<String, ToolError>;

struct RegisteredTool {
    declaration: FunctionDeclaration,
    handler: ToolHandler,
}

/// Flat name → handler table. The schema half is documentation for the
/// model; containment is enforced by the handlers themselves.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    /// The four standard tools every agent run carries.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(list_directory_declaration(), list_directory);
        registry.register(read_file_declaration(), read_file);
        registry.register(write_file_declaration(), write_file);
        registry.register(execute_script_declaration(), execute_script);
        registry
    }

    /// Register a tool, replacing any existing registration of the same name.
    pub fn register(&mut self, declaration: FunctionDeclaration, handler: ToolHandler) {
        self.tools.retain(|t| t.declaration.name != declaration.name);
        self.tools.push(RegisteredTool {
            declaration,
            handler,
        });
    }

    fn lookup(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.declaration.name == name)
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.iter().map(|t| t.declaration.clone()).collect()
    }
}

/// Executes model-requested tool calls against the sandbox.
///
/// `dispatch` is infallible by contract: unknown tools, precondition
/// failures, and handler faults all become error payloads fed back to the
/// model so the conversation can continue.
pub struct ToolDispatcher {
    sandbox: PathSandbox,
    registry: ToolRegistry,
    cfg: ToolsConfig,
    runner: Arc<dyn ScriptRunner + Send + Sync>,
    observer: Arc<Observer>,
}

impl ToolDispatcher {
    pub fn new(sandbox_root: &Path, cfg: ToolsConfig, observer: Arc<Observer>) -> Result<Self> {
        Self::with_runner(sandbox_root, cfg, observer, Arc::new(PlatformScriptRunner))
    }

    pub fn with_runner(
        sandbox_root: &Path,
        cfg: ToolsConfig,
        observer: Arc<Observer>,
        runner: Arc<dyn ScriptRunner + Send + Sync>,
    ) -> Result<Self> {
        Ok(Self {
            sandbox: PathSandbox::new(sandbox_root)?,
            registry: ToolRegistry::standard(),
            cfg,
            runner,
            observer,
        })
    }

    pub fn sandbox_root(&self) -> &Path {
        self.sandbox.root()
    }

    /// Tool schemas advertised to the model each round.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.registry.declarations()
    }

    /// Dispatch one requested tool call and wrap the outcome into a
    /// function-response part. Never returns an error to the caller.
    pub fn dispatch(&self, request: &ToolCallRequest) -> Part {
        let invocation_id = Uuid::now_v7();
        if self.observer.is_verbose() {
            self.observer.verbose_log(&format!(
                "Calling function: {}({}) invocation={invocation_id}",
                request.name,
                Value::Object(request.args.clone())
            ));
        } else {
            self.observer
                .log(&format!(" - Calling function: {}", request.name));
        }

        let Some(tool) = self.registry.lookup(&request.name) else {
            return Part::function_error(
                request.name.clone(),
                format!("Unknown function: {}", request.name),
            );
        };

        // Two-stage argument assembly: model-visible args first, then the
        // dispatcher-owned sandbox root, which overwrites on key collision.
        let mut args = request.args.clone();
        args.insert(
            WORKING_DIRECTORY_KEY.to_string(),
            json!(self.sandbox.root().to_string_lossy()),
        );

        let ctx = ToolContext {
            sandbox: &self.sandbox,
            cfg: &self.cfg,
            runner: self.runner.as_ref(),
        };
        match (tool.handler)(&ctx, &args) {
            Ok(output) => {
                self.observer
                    .log(&format!("tool {} invocation={invocation_id} ok", request.name));
                Part::function_result(request.name.clone(), output)
            }
            Err(err) => {
                self.observer.log(&format!(
                    "tool {} invocation={invocation_id} error: {err}",
                    request.name
                ));
                Part::function_error(request.name.clone(), err.to_string())
            }
        }
    }
}

// ── Standard tool handlers ─────────────────────────────────────────────

fn arg_str<'a>(
    args: &'a serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or(ToolError::MissingArgument { name })
}

fn contain(verb: &'static str, path: &str) -> ToolError {
    ToolError::Containment {
        verb,
        path: path.to_string(),
    }
}

fn list_directory_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "list_directory".to_string(),
        description: "List the immediate entries of a directory with file sizes, \
                      constrained to the working directory."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory to list, relative to the working directory. Defaults to the working directory itself."
                }
            }
        }),
    }
}

fn list_directory(
    ctx: &ToolContext<'_>,
    args: &serde_json::Map<String, Value>,
) -> Result<String, ToolError> {
    let dir = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let full = ctx.sandbox.resolve(dir).map_err(|_| contain("list", dir))?;
    if !full.is_dir() {
        return Err(ToolError::NotADirectory {
            path: dir.to_string(),
        });
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&full)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // The runtime dir is bookkeeping, not workspace content.
        if name == ".gemcode" {
            continue;
        }
        let meta = entry.metadata()?;
        entries.push((name, meta.len(), meta.is_dir()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let header = if dir == "." {
        "Result for current directory:".to_string()
    } else {
        format!("Result for '{dir}' directory:")
    };
    let mut lines = vec![header];
    for (name, size, is_dir) in entries {
        lines.push(format!("  - {name}: file_size={size} bytes, is_dir={is_dir}"));
    }
    Ok(lines.join("\n"))
}

fn read_file_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "read_file".to_string(),
        description: "Read file contents at the given path, constrained to the \
                      working directory. Long files are truncated."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file to read, relative to the working directory."
                }
            },
            "required": ["path"]
        }),
    }
}

fn read_file(
    ctx: &ToolContext<'_>,
    args: &serde_json::Map<String, Value>,
) -> Result<String, ToolError> {
    let path = arg_str(args, "path")?;
    let full = ctx
        .sandbox
        .resolve(path)
        .map_err(|_| contain("read", path))?;
    if !full.is_file() {
        return Err(ToolError::NotAFile {
            path: path.to_string(),
        });
    }

    let content = fs::read_to_string(&full)?;
    let budget = ctx.cfg.read_max_chars;
    if content.chars().count() <= budget {
        return Ok(content);
    }
    let truncated: String = content.chars().take(budget).collect();
    Ok(format!(
        "{truncated}[...File \"{path}\" truncated at {budget} characters]"
    ))
}

fn write_file_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "write_file".to_string(),
        description: "Write content to a file at the given path, constrained to the \
                      working directory. Creates parent directories as needed and \
                      overwrites existing content."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file to write, relative to the working directory."
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write."
                }
            },
            "required": ["path", "content"]
        }),
    }
}

fn write_file(
    ctx: &ToolContext<'_>,
    args: &serde_json::Map<String, Value>,
) -> Result<String, ToolError> {
    let path = arg_str(args, "path")?;
    let content = arg_str(args, "content")?;
    let full = ctx
        .sandbox
        .resolve(path)
        .map_err(|_| contain("write to", path))?;

    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full, content)?;
    Ok(format!(
        "Successfully wrote to \"{path}\" ({} characters written)",
        content.chars().count()
    ))
}

fn execute_script_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: "execute_script".to_string(),
        description: "Execute a Python script at the given path with optional \
                      arguments, constrained to the working directory."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The script to run, relative to the working directory."
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional command-line arguments for the script."
                }
            },
            "required": ["path"]
        }),
    }
}

fn execute_script(
    ctx: &ToolContext<'_>,
    args: &serde_json::Map<String, Value>,
) -> Result<String, ToolError> {
    let path = arg_str(args, "path")?;
    let full = ctx
        .sandbox
        .resolve(path)
        .map_err(|_| contain("execute", path))?;
    if !full.exists() {
        return Err(ToolError::NotFound {
            path: path.to_string(),
        });
    }
    if full.extension().and_then(|e| e.to_str()) != Some("py") {
        return Err(ToolError::NotAScript {
            path: path.to_string(),
        });
    }

    let script_args: Vec<String> = args
        .get("args")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    let timeout = Duration::from_secs(ctx.cfg.script_timeout_seconds);
    let run = ctx
        .runner
        .run(&full, &script_args, ctx.sandbox.root(), timeout)
        .map_err(|err| ToolError::SpawnFailed {
            path: path.to_string(),
            reason: err.to_string(),
        })?;

    if run.timed_out {
        return Err(ToolError::TimedOut {
            path: path.to_string(),
            seconds: ctx.cfg.script_timeout_seconds,
        });
    }
    Ok(format_script_output(&run))
}

/// Non-zero exit is reported inline in the result string, not as an error.
fn format_script_output(run: &ScriptRunResult) -> String {
    let mut sections = Vec::new();
    if !run.stdout.is_empty() {
        sections.push(format!("STDOUT: {}", run.stdout));
    }
    if !run.stderr.is_empty() {
        sections.push(format!("STDERR: {}", run.stderr));
    }
    match run.status {
        Some(0) => {}
        Some(code) => sections.push(format!("Process exited with code {code}")),
        None => sections.push("Process terminated by signal".to_string()),
    }
    if sections.is_empty() {
        return "No output produced.".to_string();
    }
    sections.join("\n")
}
