//! Entry point used by the request layer.

use crate::error::{Result, SandboxError};
use crate::sandbox::{container_name, validate_session_id, SandboxHandle};
use crate::state::SessionRegistry;
use crate::types::{ExecutionRequest, ExecutionResult, Language};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub container_name: String,
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub container_name: String,
    pub idle_secs: u64,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// A vanished container leaves a stale mapping; drop it so the next
    /// resolve recreates the sandbox.
    async fn heal<T>(&self, session_id: &str, result: Result<T>) -> Result<T> {
        if let Err(SandboxError::ContainerVanished(container)) = &result {
            warn!(session = session_id, container = %container, "Dropping stale sandbox");
            if let Err(e) = self.registry.evict_and_stop(session_id).await {
                warn!(session = session_id, error = %e, "Cleanup of stale sandbox failed");
            }
        }
        result
    }

    pub async fn handle(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if request.code_blocks.is_empty() {
            return Err(SandboxError::InvalidRequest(
                "No code blocks provided.".to_string(),
            ));
        }
        let session_id = request.key.sandbox_id()?;
        let folder_id = request.key.folder_id()?;
        validate_session_id(session_id)?;
        validate_session_id(folder_id)?;
        let sandbox = self.registry.resolve(session_id).await?;
        let result = sandbox.execute(folder_id, &request.code_blocks).await;
        let result = self.heal(session_id, result).await?;
        info!(
            session = session_id,
            folder = folder_id,
            blocks = request.code_blocks.len(),
            exit_code = result.exit_code,
            "Executed"
        );
        Ok(result)
    }

    pub async fn setup(
        &self,
        session_id: &str,
        packages: &[String],
        language: &Language,
    ) -> Result<ExecutionResult> {
        validate_session_id(session_id)?;
        let sandbox = self.registry.resolve(session_id).await?;
        let result = sandbox.install_packages(packages, language).await;
        let result = self.heal(session_id, result).await?;
        info!(
            session = session_id,
            language = %language,
            exit_code = result.exit_code,
            "Installed packages"
        );
        Ok(result)
    }

    /// Clear one staging folder of the session's sandbox. Returns whether a
    /// sandbox was registered.
    pub async fn remove_session(&self, session_id: &str, folder_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        match self.registry.get(session_id).await {
            Some(sandbox) => {
                sandbox.remove_session(folder_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop and forget the session's sandbox.
    ///
    /// Containers left behind by an earlier process are found through their
    /// deterministic name and stopped as well.
    pub async fn kill(&self, session_id: &str) -> Result<KillOutcome> {
        validate_session_id(session_id)?;
        let existed = self.registry.evict_and_stop(session_id).await?;
        info!(session = session_id, existed, "Killed sandbox");
        Ok(KillOutcome {
            container_name: container_name(session_id),
            existed,
        })
    }

    /// Resolve the sandbox and mark it active.
    pub async fn keep_alive(&self, session_id: &str) -> Result<Arc<SandboxHandle>> {
        validate_session_id(session_id)?;
        let sandbox = self.registry.resolve(session_id).await?;
        sandbox.touch();
        Ok(sandbox)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .registry
            .handles()
            .await
            .into_iter()
            .map(|h| SessionInfo {
                session_id: h.session_id().to_string(),
                container_name: h.container_name().to_string(),
                idle_secs: h.idle_for().as_secs(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Stop every registered sandbox.
    pub async fn shutdown(&self) {
        let handles = self.registry.drain().await;
        info!(count = handles.len(), "Stopping sandboxes");
        for handle in handles {
            if let Err(e) = handle.stop().await {
                warn!(container = handle.container_name(), error = %e, "Stop failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::engine::fake::FakeEngine;
    use crate::types::{CodeBlock, SessionKey};
    use std::path::Path;

    fn orchestrator(engine: &Arc<FakeEngine>, dir: &Path) -> Orchestrator {
        Orchestrator::new(Arc::new(SessionRegistry::new(
            engine.clone(),
            SandboxConfig {
                bind_dir: dir.to_path_buf(),
                work_dir: dir.to_path_buf(),
                start_timeout_secs: 1,
                ..SandboxConfig::default()
            },
        )))
    }

    fn request(session: &str, codes: &[&str]) -> ExecutionRequest {
        keyed(SessionKey::session(session), codes)
    }

    fn keyed(key: SessionKey, codes: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            key,
            code_blocks: codes
                .iter()
                .map(|code| CodeBlock {
                    code: code.to_string(),
                    language: Language::Python,
                    files: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_empty_request_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        let err = orch.handle(&request("s", &[])).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_creates_sandbox_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        let result = orch.handle(&request("s", &["print hello"])).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.console, "hello\n");

        orch.handle(&request("s", &["print again"])).await.unwrap();
        assert_eq!(engine.create_count(), 1);
    }

    #[tokio::test]
    async fn test_setup_then_execute_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        let setup = orch
            .setup("s", &["nonexistent-pkg-xyz".to_string()], &Language::Python)
            .await
            .unwrap();
        assert_ne!(setup.exit_code, 0);

        let result = orch.handle(&request("s", &["print still works"])).await.unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_kill_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        orch.handle(&request("s", &["print hi"])).await.unwrap();
        let outcome = orch.kill("s").await.unwrap();
        assert!(outcome.existed);
        assert_eq!(outcome.container_name, "sandbox-s");
        assert!(!engine.is_running("sandbox-s"));

        engine.vanish("sandbox-s");
        assert!(!orch.kill("s").await.unwrap().existed);
    }

    #[tokio::test]
    async fn test_kill_finds_orphan_container() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        engine.insert_running("sandbox-orphan", dir.path().join("sandbox-orphan"));
        let orch = orchestrator(&engine, dir.path());

        assert!(orch.kill("orphan").await.unwrap().existed);
        assert!(!engine.is_running("sandbox-orphan"));
    }

    #[tokio::test]
    async fn test_remove_session_requires_registration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        assert!(!orch.remove_session("s", "s").await.unwrap());
        orch.handle(&request("s", &["print hi"])).await.unwrap();
        assert!(orch.remove_session("s", "s").await.unwrap());

        let result = orch.handle(&request("s", &["print back"])).await.unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_flow_owns_container_and_session_owns_folder() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        orch.handle(&keyed(SessionKey::flow("f1", "run-a"), &["write output a"]))
            .await
            .unwrap();
        let b = orch
            .handle(&keyed(SessionKey::flow("f1", "run-b"), &["print b"]))
            .await
            .unwrap();
        assert_eq!(b.output, "");
        assert_eq!(engine.create_count(), 1);

        let sandbox = orch.registry.get("f1").await.unwrap();
        assert!(orch.remove_session("f1", "run-a").await.unwrap());
        assert!(!sandbox.staging_dir("run-a").exists());
        assert!(sandbox.staging_dir("run-b").exists());

        assert!(orch.kill("f1").await.unwrap().existed);
        assert!(!engine.is_running("sandbox-f1"));
    }

    #[tokio::test]
    async fn test_request_without_ids_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        let err = orch
            .handle(&keyed(SessionKey::default(), &["print hi"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_vanished_container_recreated_on_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        orch.handle(&request("s", &["print hi"])).await.unwrap();
        engine.vanish("sandbox-s");

        let err = orch.handle(&request("s", &["print hi"])).await.unwrap_err();
        assert!(matches!(err, SandboxError::ContainerVanished(_)));

        let result = orch.handle(&request("s", &["print hi"])).await.unwrap();
        assert!(result.is_success());
        assert_eq!(engine.create_count(), 2);
    }

    #[tokio::test]
    async fn test_sessions_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orch = orchestrator(&engine, dir.path());

        orch.keep_alive("b").await.unwrap();
        orch.keep_alive("a").await.unwrap();
        let sessions = orch.sessions().await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "a");

        orch.shutdown().await;
        assert!(orch.sessions().await.is_empty());
        assert!(!engine.is_running("sandbox-a"));
        assert!(!engine.is_running("sandbox-b"));
    }
}
