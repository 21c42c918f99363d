//! Request and result types shared by the orchestrator and the HTTP layer.

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Language of a code block.
///
/// Unknown names deserialize into [`Language::Unsupported`] so they surface
/// as a failed block instead of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    Python,
    JavaScript,
    Shell,
    Bash,
    Unsupported(String),
}

impl Language {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Language::Python,
            "javascript" | "js" | "node" => Language::JavaScript,
            "shell" | "sh" => Language::Shell,
            "bash" => Language::Bash,
            other => Language::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "sh",
            Language::Bash => "bash",
            Language::Unsupported(name) => name,
        }
    }

    /// Program invoked on the entrypoint file, if the language can run.
    pub fn interpreter(&self) -> Option<&'static str> {
        match self {
            Language::Python => Some("python"),
            Language::JavaScript => Some("node"),
            Language::Shell => Some("sh"),
            Language::Bash => Some("bash"),
            Language::Unsupported(_) => None,
        }
    }

    /// Command that installs `package`, if the language has a package manager.
    pub fn install_command(&self, package: &str) -> Option<Vec<String>> {
        match self {
            Language::Python => Some(vec![
                "pip".into(),
                "install".into(),
                package.into(),
                "--root-user-action=ignore".into(),
            ]),
            Language::JavaScript => Some(vec!["npm".into(), "install".into(), package.into()]),
            _ => None,
        }
    }
}

impl From<String> for Language {
    fn from(name: String) -> Self {
        Language::parse(&name)
    }
}

impl From<Language> for String {
    fn from(language: Language) -> Self {
        language.name().to_string()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A file staged next to the entrypoint before a block runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    #[serde(alias = "path")]
    pub name: String,
    /// Plain text, or `data:<mime>;base64,<payload>` for binary content.
    #[serde(alias = "data")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub language: Language,
    #[serde(default)]
    pub files: Option<Vec<File>>,
}

/// Addresses a sandbox and a staging folder inside it.
///
/// `flowId` owns the container and `sessionId` the folder; either one alone
/// addresses both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SessionKey {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            flow_id: None,
            session_id: Some(session_id.into()),
        }
    }

    pub fn flow(flow_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            flow_id: Some(flow_id.into()),
            session_id: Some(session_id.into()),
        }
    }

    fn missing() -> SandboxError {
        SandboxError::InvalidRequest("sessionId or flowId is required".to_string())
    }

    /// Id the sandbox container is keyed by.
    pub fn sandbox_id(&self) -> Result<&str> {
        self.flow_id
            .as_deref()
            .or(self.session_id.as_deref())
            .ok_or_else(Self::missing)
    }

    /// Id of the staging folder inside the sandbox.
    pub fn folder_id(&self) -> Result<&str> {
        self.session_id
            .as_deref()
            .or(self.flow_id.as_deref())
            .ok_or_else(Self::missing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(flatten)]
    pub key: SessionKey,
    /// Execution order; later blocks do not run once one fails.
    #[serde(default)]
    pub code_blocks: Vec<CodeBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub console: String,
    pub output: String,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
