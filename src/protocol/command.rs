//! Command request and result payloads

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// How the remote interpreter should treat submitted command text
///
/// Forwarded verbatim; this crate never interprets it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecMode {
    /// Run the text as a script file path, with optional arguments
    ExecuteFile,
    /// Run the text as one or more statements
    #[default]
    ExecuteStatement,
    /// Evaluate the text as an expression and return its value
    EvaluateStatement,
}

impl ExecMode {
    /// Wire name of this mode
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecuteFile => "ExecuteFile",
            Self::ExecuteStatement => "ExecuteStatement",
            Self::EvaluateStatement => "EvaluateStatement",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "executefile" | "execute_file" | "file" => Ok(Self::ExecuteFile),
            "executestatement" | "execute_statement" | "statement" => Ok(Self::ExecuteStatement),
            "evaluatestatement" | "evaluate_statement" | "evaluate" | "eval" => {
                Ok(Self::EvaluateStatement)
            }
            other => Err(format!("unknown exec mode: {other}")),
        }
    }
}

/// `command` payload sent over the command channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub unattended: bool,
    pub exec_mode: ExecMode,
}

impl CommandRequest {
    /// Build a request
    #[must_use]
    pub fn new(command: impl Into<String>, unattended: bool, exec_mode: ExecMode) -> Self {
        Self {
            command: command.into(),
            unattended,
            exec_mode,
        }
    }
}

/// `command_result` payload returned by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub result: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_output"
    )]
    pub output: Option<Vec<String>>,
}

impl CommandResult {
    /// Successful result with no captured output
    #[must_use]
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            result: result.into(),
            output: None,
        }
    }

    /// Failed result with no captured output
    #[must_use]
    pub fn failed(result: impl Into<String>) -> Self {
        Self {
            success: false,
            result: result.into(),
            output: None,
        }
    }
}

/// Accept output lines as plain strings or as `{"type": .., "output": ..}` log entries
fn deserialize_output<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Text(String),
        Log { output: String },
    }

    let entries = Option::<Vec<Entry>>::deserialize(deserializer)?;
    Ok(entries.map(|entries| {
        entries
            .into_iter()
            .map(|entry| match entry {
                Entry::Text(text) | Entry::Log { output: text } => text,
            })
            .collect()
    }))
}
