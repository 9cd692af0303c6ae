use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::PlanPatch;

/// Closed vocabulary of action types a step may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    WriteFile,
    ReadFile,
    AppendFile,
    DeleteFile,
    ListDir,
    ShellCommand,
    HttpRequest,
    ToolCall,
    LlmCall,
    ParseJson,
    MemoryWrite,
    FinalOutput,
    AskUser,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::WriteFile,
        ActionKind::ReadFile,
        ActionKind::AppendFile,
        ActionKind::DeleteFile,
        ActionKind::ListDir,
        ActionKind::ShellCommand,
        ActionKind::HttpRequest,
        ActionKind::ToolCall,
        ActionKind::LlmCall,
        ActionKind::ParseJson,
        ActionKind::MemoryWrite,
        ActionKind::FinalOutput,
        ActionKind::AskUser,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::WriteFile => "write_file",
            ActionKind::ReadFile => "read_file",
            ActionKind::AppendFile => "append_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::ListDir => "list_dir",
            ActionKind::ShellCommand => "shell_command",
            ActionKind::HttpRequest => "http_request",
            ActionKind::ToolCall => "tool_call",
            ActionKind::LlmCall => "llm_call",
            ActionKind::ParseJson => "parse_json",
            ActionKind::MemoryWrite => "memory_write",
            ActionKind::FinalOutput => "final_output",
            ActionKind::AskUser => "ask_user",
        }
    }

    /// Parses a type name, accepting the short aliases planners tend to emit.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "write_file" | "write" => ActionKind::WriteFile,
            "read_file" | "read" => ActionKind::ReadFile,
            "append_file" | "append" => ActionKind::AppendFile,
            "delete_file" | "delete" => ActionKind::DeleteFile,
            "list_dir" | "list_files" | "list" => ActionKind::ListDir,
            "shell_command" | "shell" | "run_shell" | "command" => ActionKind::ShellCommand,
            "http_request" | "http" => ActionKind::HttpRequest,
            "tool_call" | "tool" | "invoke_tool" => ActionKind::ToolCall,
            "llm_call" | "llm" => ActionKind::LlmCall,
            "parse_json" | "json" => ActionKind::ParseJson,
            "memory_write" | "memory" => ActionKind::MemoryWrite,
            "final_output" | "final" | "output" => ActionKind::FinalOutput,
            "ask_user" | "ask" | "user_input" => ActionKind::AskUser,
            _ => return None,
        };
        Some(kind)
    }

    /// Kinds that count as a verification run for the validation-step gate.
    pub fn is_verifier(self) -> bool {
        matches!(self, ActionKind::ShellCommand | ActionKind::ToolCall)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWrite {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePath {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCommand {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    json!({})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCall {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseJson {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskUser {
    #[serde(default)]
    pub question: String,
}

/// A structured command produced by one LLM call for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    WriteFile(FileWrite),
    ReadFile(FilePath),
    AppendFile(FileWrite),
    DeleteFile(FilePath),
    ListDir(FilePath),
    ShellCommand(ShellCommand),
    HttpRequest(HttpRequest),
    ToolCall(ToolCall),
    LlmCall(LlmCall),
    ParseJson(ParseJson),
    MemoryWrite(MemoryWrite),
    FinalOutput(FinalOutput),
    AskUser(AskUser),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSchemaError {
    UnknownType(String),
    InvalidPayload { kind: ActionKind, reason: String },
    MissingField { kind: ActionKind, field: &'static str },
}

impl fmt::Display for ActionSchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(raw) => write!(f, "unknown action type '{}'", raw),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "invalid {} payload: {}", kind, reason)
            }
            Self::MissingField { kind, field } => {
                write!(f, "{} requires non-empty `{}`", kind, field)
            }
        }
    }
}

impl std::error::Error for ActionSchemaError {}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::WriteFile(_) => ActionKind::WriteFile,
            Action::ReadFile(_) => ActionKind::ReadFile,
            Action::AppendFile(_) => ActionKind::AppendFile,
            Action::DeleteFile(_) => ActionKind::DeleteFile,
            Action::ListDir(_) => ActionKind::ListDir,
            Action::ShellCommand(_) => ActionKind::ShellCommand,
            Action::HttpRequest(_) => ActionKind::HttpRequest,
            Action::ToolCall(_) => ActionKind::ToolCall,
            Action::LlmCall(_) => ActionKind::LlmCall,
            Action::ParseJson(_) => ActionKind::ParseJson,
            Action::MemoryWrite(_) => ActionKind::MemoryWrite,
            Action::FinalOutput(_) => ActionKind::FinalOutput,
            Action::AskUser(_) => ActionKind::AskUser,
        }
    }

    /// Builds a typed action from a raw type name and JSON payload.
    pub fn from_parts(kind: ActionKind, payload: Value) -> Result<Self, ActionSchemaError> {
        let payload = if payload.is_null() { json!({}) } else { payload };
        if !payload.is_object() {
            return Err(ActionSchemaError::InvalidPayload {
                kind,
                reason: "payload must be a JSON object".to_string(),
            });
        }
        let action: Action =
            serde_json::from_value(json!({ "type": kind.as_str(), "payload": payload })).map_err(
                |e| ActionSchemaError::InvalidPayload {
                    kind,
                    reason: e.to_string(),
                },
            )?;
        action.validate()?;
        Ok(action)
    }

    /// Checks required fields are present and non-empty.
    pub fn validate(&self) -> Result<(), ActionSchemaError> {
        let kind = self.kind();
        let missing = |field: &'static str| Err(ActionSchemaError::MissingField { kind, field });
        match self {
            Action::WriteFile(w) | Action::AppendFile(w) => {
                if w.path.trim().is_empty() {
                    return missing("path");
                }
            }
            Action::ReadFile(p) | Action::DeleteFile(p) => {
                if p.path.trim().is_empty() {
                    return missing("path");
                }
            }
            Action::ListDir(_) => {}
            Action::ShellCommand(s) => {
                if s.command.trim().is_empty() {
                    return missing("command");
                }
            }
            Action::HttpRequest(h) => {
                if h.url.trim().is_empty() {
                    return missing("url");
                }
            }
            Action::ToolCall(t) => {
                if t.tool.trim().is_empty() {
                    return missing("tool");
                }
            }
            Action::LlmCall(l) => {
                if l.prompt.trim().is_empty() {
                    return missing("prompt");
                }
            }
            Action::ParseJson(p) => {
                if p.text.trim().is_empty() {
                    return missing("text");
                }
            }
            Action::MemoryWrite(m) => {
                if m.content.trim().is_empty() {
                    return missing("content");
                }
            }
            Action::FinalOutput(o) => {
                if o.content.trim().is_empty() {
                    return missing("content");
                }
            }
            Action::AskUser(a) => {
                if a.question.trim().is_empty() {
                    return missing("question");
                }
            }
        }
        Ok(())
    }

    /// Short human summary used in observations and logs.
    pub fn describe(&self) -> String {
        match self {
            Action::WriteFile(w) => format!("write_file {}", w.path),
            Action::AppendFile(w) => format!("append_file {}", w.path),
            Action::ReadFile(p) => format!("read_file {}", p.path),
            Action::DeleteFile(p) => format!("delete_file {}", p.path),
            Action::ListDir(p) => format!("list_dir {}", p.path),
            Action::ShellCommand(s) => format!("shell_command `{}`", s.command),
            Action::HttpRequest(h) => format!("http_request {} {}", h.method, h.url),
            Action::ToolCall(t) => format!("tool_call {}", t.tool),
            Action::LlmCall(_) => "llm_call".to_string(),
            Action::ParseJson(_) => "parse_json".to_string(),
            Action::MemoryWrite(m) => format!("memory_write {}", m.key),
            Action::FinalOutput(_) => "final_output".to_string(),
            Action::AskUser(a) => format!("ask_user {}", a.question),
        }
    }
}

/// Untyped action as it arrives from the model, before normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Top-level object a step LLM call must return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action: RawAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_patch: Option<PlanPatch>,
}
