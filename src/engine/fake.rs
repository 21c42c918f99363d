//! In-memory engine for tests.
//!
//! Execs are interpreted instead of run. A `cd <folder> && timeout <n> <interp>
//! entrypoint` command reads the staged entrypoint from the bind directory and
//! runs it line by line:
//!
//! - `print <text>`  appends `<text>\n` to the output
//! - `write <name> <text>` writes a file next to the entrypoint
//! - `exit <code>`   stops with that exit code
//! - `hang`          behaves like a block killed by `timeout` (exit 124)
//!
//! `pip install` / `npm install` succeed unless the package name contains
//! `nonexistent`.

use super::{ContainerEngine, ContainerSpec, ContainerStatus, CpuCounters, EngineError, ExecOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    bind_dir: PathBuf,
    running: bool,
    cpu: CpuCounters,
}

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub restarts: AtomicUsize,
    pub stops: AtomicUsize,
    pub execs: Mutex<Vec<Vec<String>>>,
    create_delay: Option<Duration>,
    stop_delay: Option<Duration>,
    exec_delay: Option<Duration>,
    never_runs: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow down `create` to widen race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Slow down `stop`, leaving the container running until it returns.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    /// Keep every entrypoint run in flight for `delay`.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Containers accept `start` but never report running.
    pub fn never_running(mut self) -> Self {
        self.never_runs = true;
        self
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|c| c.running)
    }

    /// Register a running container without going through `create`.
    pub fn insert_running(&self, name: &str, bind_dir: PathBuf) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                bind_dir,
                running: true,
                cpu: CpuCounters::default(),
            },
        );
    }

    /// Advance a container's CPU counters by the given deltas.
    pub fn advance_cpu(&self, name: &str, container_delta: u64, system_delta: u64) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.cpu.container_usage += container_delta;
            c.cpu.system_usage += system_delta;
            c.cpu.online_cpus = 1;
        }
    }

    /// Remove a container behind the registry's back.
    pub fn vanish(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }

    fn bind_dir(&self, name: &str) -> Result<PathBuf, EngineError> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.bind_dir.clone())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}

fn interpret(folder: &std::path::Path) -> ExecOutput {
    let source = match std::fs::read_to_string(folder.join("entrypoint")) {
        Ok(source) => source,
        Err(e) => {
            return ExecOutput {
                exit_code: 2,
                output: format!("can't open file 'entrypoint': {e}\n"),
            }
        }
    };
    let mut output = String::new();
    for line in source.lines() {
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "print" => {
                output.push_str(rest);
                output.push('\n');
            }
            "write" => {
                let (name, text) = rest.split_once(' ').unwrap_or((rest, ""));
                std::fs::write(folder.join(name), text).unwrap();
            }
            "exit" => {
                return ExecOutput {
                    exit_code: rest.trim().parse().unwrap_or(1),
                    output,
                }
            }
            "hang" => return ExecOutput { exit_code: 124, output },
            _ => {}
        }
    }
    ExecOutput { exit_code: 0, output }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ensure_image(&self, _image: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            FakeContainer {
                bind_dir: PathBuf::from(&spec.bind_dir),
                running: false,
                cpu: CpuCounters::default(),
            },
        );
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        match self.containers.lock().unwrap().get(name) {
            Some(c) if c.running => Ok(ContainerStatus::Running),
            Some(_) => Ok(ContainerStatus::Stopped),
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let never_runs = self.never_runs;
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.running = !never_runs;
                Ok(())
            }
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    async fn restart(&self, name: &str) -> Result<(), EngineError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.start(name).await
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, EngineError> {
        let bind_dir = self.bind_dir(name)?;
        self.execs.lock().unwrap().push(command.to_vec());

        match command.first().map(String::as_str) {
            Some("pip") | Some("npm") => {
                let package = command.get(2).cloned().unwrap_or_default();
                if package.contains("nonexistent") {
                    Ok(ExecOutput {
                        exit_code: 1,
                        output: format!(
                            "ERROR: No matching distribution found for {package}\n"
                        ),
                    })
                } else {
                    Ok(ExecOutput {
                        exit_code: 0,
                        output: format!("Successfully installed {package}\n"),
                    })
                }
            }
            Some("sh") => {
                let script = command.get(2).cloned().unwrap_or_default();
                let folder = script
                    .strip_prefix("cd ")
                    .and_then(|rest| rest.split_once(" &&"))
                    .map(|(folder, _)| folder.to_string())
                    .unwrap_or_default();
                if let Some(delay) = self.exec_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(interpret(&bind_dir.join(folder)))
            }
            _ => Ok(ExecOutput {
                exit_code: 127,
                output: "command not found\n".to_string(),
            }),
        }
    }

    async fn stats(&self, name: &str) -> Result<CpuCounters, EngineError> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.cpu)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }
}
