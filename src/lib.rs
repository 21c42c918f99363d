//! Session-scoped container sandboxes for running untrusted code.
//!
//! Each session id owns at most one container. Code blocks are staged into a
//! per-session folder bind-mounted into that container and run one after
//! another; an idle reaper stops containers nobody is using.

pub mod config;
pub mod engine;
pub mod error;
pub mod http_server;
pub mod orchestrator;
pub mod reaper;
pub mod sandbox;
pub mod state;
pub mod types;

pub use config::{ReaperConfig, SandboxConfig};
pub use engine::{ContainerEngine, DockerEngine};
pub use error::{Result, SandboxError};
pub use orchestrator::Orchestrator;
pub use reaper::IdleReaper;
pub use sandbox::SandboxHandle;
pub use state::SessionRegistry;
pub use types::{CodeBlock, ExecutionRequest, ExecutionResult, File, Language, SessionKey};
