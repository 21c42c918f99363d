//! One sandbox container and its host-side staging area.
//!
//! A [`SandboxHandle`] owns a single container named `sandbox-<sessionId>`.
//! The name is a pure function of the session id, which is how a restarted
//! process finds containers it created earlier instead of leaking them.

use crate::config::SandboxConfig;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, EngineError, CONTAINER_WORKSPACE};
use crate::error::{Result, SandboxError};
use crate::types::{CodeBlock, ExecutionResult, File, Language};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// File every block's code is written to before it runs.
pub const ENTRYPOINT: &str = "entrypoint";
/// File a sandboxed program may write to hand back a result.
pub const OUTPUT_FILE: &str = "output";
/// Exit code `timeout(1)` reports when it killed the program.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
pub const TIMEOUT_MARKER: &str = "Timeout";

const START_POLL_INITIAL: Duration = Duration::from_millis(100);
const START_POLL_MAX: Duration = Duration::from_secs(1);

/// Container name for a session. Stable across process restarts.
pub fn container_name(session_id: &str) -> String {
    format!("sandbox-{session_id}")
}

/// Session ids end up in container names and shell commands.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let mut chars = session_id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "invalid session id {session_id:?}"
        )))
    }
}

/// Staging folder for `folder_id`, relative to the sandbox workspace.
pub fn staging_folder_name(folder_id: &str) -> String {
    format!("codeblock_{folder_id}")
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SandboxHandle {
    session_id: String,
    container_name: String,
    /// `<work root>/<container>`, as this process sees it.
    work_dir: PathBuf,
    /// `<bind root>/<container>`, as the engine sees it.
    bind_dir: PathBuf,
    memory_bytes: i64,
    config: Arc<SandboxConfig>,
    engine: Arc<dyn ContainerEngine>,
    last_activity_ms: AtomicU64,
    activity: AtomicU64,
    exec_lock: Mutex<()>,
}

impl SandboxHandle {
    pub fn new(
        session_id: &str,
        engine: Arc<dyn ContainerEngine>,
        config: Arc<SandboxConfig>,
    ) -> Result<Self> {
        validate_session_id(session_id)?;
        let memory_bytes = config.memory_bytes().map_err(SandboxError::InvalidRequest)?;
        let container_name = container_name(session_id);
        Ok(Self {
            session_id: session_id.to_string(),
            work_dir: config.work_dir.join(&container_name),
            bind_dir: config.bind_dir.join(&container_name),
            container_name,
            memory_bytes,
            config,
            engine,
            last_activity_ms: AtomicU64::new(unix_millis(SystemTime::now())),
            activity: AtomicU64::new(0),
            exec_lock: Mutex::new(()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn staging_dir(&self, folder_id: &str) -> PathBuf {
        self.work_dir.join(staging_folder_name(folder_id))
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(unix_millis(SystemTime::now()), Ordering::SeqCst);
        self.activity.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumped on every execute, install or keep-alive.
    pub fn activity_count(&self) -> u64 {
        self.activity.load(Ordering::SeqCst)
    }

    /// True while an install, execute or folder removal holds the sandbox.
    pub fn is_busy(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }

    pub fn last_activity_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst))
    }

    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_activity_at())
            .unwrap_or_default()
    }

    fn spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.container_name.clone(),
            image: self.config.image.clone(),
            entrypoint: vec!["/bin/sh".to_string()],
            tty: true,
            auto_remove: self.config.auto_remove,
            bind_dir: self.bind_dir.to_string_lossy().into_owned(),
            working_dir: CONTAINER_WORKSPACE.to_string(),
            memory_bytes: self.memory_bytes,
            network: self.config.network.clone(),
        }
    }

    fn map_engine_error(&self, error: EngineError) -> SandboxError {
        if error.is_not_found() {
            SandboxError::ContainerVanished(self.container_name.clone())
        } else {
            SandboxError::Engine(error)
        }
    }

    /// Create the container if needed and wait until the engine reports it running.
    pub async fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir).await?;
        let name = self.container_name.as_str();

        match self.engine.inspect(name).await {
            Ok(ContainerStatus::Running) => {
                info!(container = name, "Restarting running orphan container");
                self.engine.restart(name).await?;
            }
            Ok(ContainerStatus::Stopped) => {
                info!(container = name, "Starting existing container");
                self.engine.start(name).await?;
            }
            Err(e) if e.is_not_found() => {
                self.engine.ensure_image(&self.config.image).await?;
                info!(container = name, image = %self.config.image, "Creating container");
                self.engine.create(&self.spec()).await?;
                self.engine.start(name).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_until_running().await?;
        self.touch();
        info!(container = name, session = %self.session_id, "Sandbox running");
        Ok(())
    }

    async fn wait_until_running(&self) -> Result<()> {
        let timeout = self.config.start_timeout();
        let deadline = Instant::now() + timeout;
        let mut delay = START_POLL_INITIAL;
        loop {
            match self.engine.inspect(&self.container_name).await {
                Ok(ContainerStatus::Running) => return Ok(()),
                Ok(ContainerStatus::Stopped) => {}
                Err(e) => return Err(self.map_engine_error(e)),
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(container = %self.container_name, "Container did not reach running state");
                return Err(SandboxError::FailedToStart {
                    container: self.container_name.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(START_POLL_MAX);
        }
    }

    /// Install packages one by one, stopping at the first failure.
    pub async fn install_packages(
        &self,
        packages: &[String],
        language: &Language,
    ) -> Result<ExecutionResult> {
        let _guard = self.exec_lock.lock().await;
        self.touch();
        let mut console = String::new();
        let mut exit_code = 0;

        for package in packages.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let Some(command) = language.install_command(package) else {
                console.push_str(&format!(
                    "Unsupported package manager for language {language}\n"
                ));
                exit_code = 1;
                break;
            };
            let out = self
                .engine
                .exec(&self.container_name, &command)
                .await
                .map_err(|e| self.map_engine_error(e))?;
            debug!(container = %self.container_name, package, exit_code = out.exit_code, "install");
            console.push_str(&out.output);
            exit_code = out.exit_code;
            if exit_code != 0 {
                break;
            }
        }

        self.touch();
        Ok(ExecutionResult {
            exit_code,
            console,
            output: String::new(),
        })
    }

    /// Run blocks in order inside the container, halting at the first non-zero exit.
    ///
    /// Blocks are staged in the `folder_id` folder, which persists across calls.
    pub async fn execute(&self, folder_id: &str, blocks: &[CodeBlock]) -> Result<ExecutionResult> {
        validate_session_id(folder_id)?;
        let _guard = self.exec_lock.lock().await;
        self.touch();
        let folder_name = staging_folder_name(folder_id);
        let folder = self.work_dir.join(&folder_name);
        let mut console = String::new();
        let mut exit_code = 0;

        for block in blocks {
            let Some(interpreter) = block.language.interpreter() else {
                console.push_str(&format!("Unsupported language {}\n", block.language));
                exit_code = 1;
                break;
            };

            fs::create_dir_all(&folder).await?;
            fs::write(folder.join(ENTRYPOINT), &block.code).await?;
            match stage_files(&folder, block.files.as_deref().unwrap_or_default()).await {
                Ok(()) => {}
                Err(SandboxError::InvalidRequest(message)) => {
                    console.push_str(&message);
                    console.push('\n');
                    exit_code = 1;
                    break;
                }
                Err(e) => return Err(e),
            }

            let command = vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "cd {folder_name} && timeout {} {interpreter} {ENTRYPOINT}",
                    self.config.timeout_secs
                ),
            ];
            let out = self
                .engine
                .exec(&self.container_name, &command)
                .await
                .map_err(|e| self.map_engine_error(e))?;

            let mut chunk = out.output;
            if out.exit_code == TIMEOUT_EXIT_CODE {
                chunk.push('\n');
                chunk.push_str(TIMEOUT_MARKER);
            }
            debug!(
                container = %self.container_name,
                language = %block.language,
                exit_code = out.exit_code,
                "block finished"
            );
            console.push_str(&chunk);
            exit_code = out.exit_code;
            if exit_code != 0 {
                break;
            }
        }

        let output = match fs::read(folder.join(OUTPUT_FILE)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        self.touch();
        Ok(ExecutionResult {
            exit_code,
            console,
            output,
        })
    }

    /// Delete the `folder_id` staging folder. Missing folders are fine.
    pub async fn remove_session(&self, folder_id: &str) -> Result<()> {
        validate_session_id(folder_id)?;
        let _guard = self.exec_lock.lock().await;
        let folder = self.staging_dir(folder_id);
        match fs::remove_dir_all(&folder).await {
            Ok(()) => {
                info!(path = %folder.display(), "Removed session folder");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the container and drop its host-side working directory.
    pub async fn stop(&self) -> Result<()> {
        match self.engine.stop(&self.container_name).await {
            Ok(()) => info!(container = %self.container_name, "Stopped container"),
            Err(e) if e.is_not_found() => {
                debug!(container = %self.container_name, "Container already gone")
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_running(&self) -> bool {
        match self.engine.inspect(&self.container_name).await {
            Ok(status) => status == ContainerStatus::Running,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(container = %self.container_name, error = %e, "inspect failed");
                }
                false
            }
        }
    }

    /// Whether the engine knows this container at all.
    pub async fn exists(&self) -> Result<bool> {
        match self.engine.inspect(&self.container_name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolve an attached file's name to a path inside `folder`.
fn staged_path(folder: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name.trim_start_matches('/'));
    let mut path = folder.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => {
                return Err(SandboxError::InvalidRequest(format!(
                    "file path {name:?} escapes the staging folder"
                )))
            }
        }
    }
    if depth == 0 {
        return Err(SandboxError::InvalidRequest(format!(
            "file path {name:?} is empty"
        )));
    }
    Ok(path)
}

fn decode_content(file: &File) -> Result<Vec<u8>> {
    if !file.content.starts_with("data:") {
        return Ok(file.content.as_bytes().to_vec());
    }
    let (_, payload) = file.content.split_once(',').ok_or_else(|| {
        SandboxError::InvalidRequest(format!("file {:?} has a malformed data URI", file.name))
    })?;
    BASE64_STANDARD.decode(payload.trim()).map_err(|e| {
        SandboxError::InvalidRequest(format!("file {:?} is not valid base64: {e}", file.name))
    })
}

async fn stage_files(folder: &Path, files: &[File]) -> Result<()> {
    for file in files {
        let path = staged_path(folder, &file.name)?;
        let bytes = decode_content(file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
    }
    Ok(())
}
