//! Executor abstraction for coding-agent runs.
//!
//! The [`AgentExecutor`] trait decouples the iteration controller from the
//! actual agent backend. [`ProcessExecutor`] runs the configured agent command
//! as a child process; tests use a scripted executor that finishes agents on
//! demand without spawning anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::ids::generate_id;
use crate::core::types::AgentStatus;
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, spawn_command};

/// Continuation fired once an agent reaches a terminal status.
pub type CompletionCallback = Box<dyn FnOnce(AgentHandle) + Send + 'static>;

/// Snapshot of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub id: String,
    pub project_path: PathBuf,
    pub status: AgentStatus,
    pub output: String,
    pub error: Option<String>,
}

impl AgentHandle {
    pub fn running(id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            project_path: project_path.into(),
            status: AgentStatus::Running,
            output: String::new(),
            error: None,
        }
    }
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor: Send + Sync {
    /// Start an agent against `project_path` with `prompt`; returns its id.
    ///
    /// Errors mean nothing was started.
    fn launch(&self, project_path: &Path, prompt: &str) -> Result<String>;

    /// Current handle for `agent_id`.
    ///
    /// `None` once the agent has terminated and its callback has fired.
    fn get(&self, agent_id: &str) -> Option<AgentHandle>;

    /// Register the single completion callback for `agent_id`.
    ///
    /// Fires exactly once after the agent terminates, immediately if it
    /// already has. A second registration for the same id is an error.
    fn set_completion_callback(&self, agent_id: &str, callback: CompletionCallback) -> Result<()>;

    fn is_agent_running_in_folder(&self, project_path: &Path) -> bool;
}

/// Book-keeping shared between executor implementations.
///
/// A slot is dropped as soon as its agent is terminal and the callback has
/// been handed the final handle.
#[derive(Default)]
pub struct AgentRegistry {
    slots: Mutex<HashMap<String, AgentSlot>>,
}

struct AgentSlot {
    handle: AgentHandle,
    callback: Option<CompletionCallback>,
    callback_registered: bool,
}

impl AgentRegistry {
    pub fn insert(&self, handle: AgentHandle) {
        let mut slots = self.lock();
        slots.insert(
            handle.id.clone(),
            AgentSlot {
                handle,
                callback: None,
                callback_registered: false,
            },
        );
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.lock().get(agent_id).map(|slot| slot.handle.clone())
    }

    /// Record the terminal state and fire the callback if one is waiting.
    pub fn finish(
        &self,
        agent_id: &str,
        status: AgentStatus,
        output: String,
        error: Option<String>,
    ) -> Result<()> {
        let (handle, callback) = {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(agent_id)
                .ok_or_else(|| anyhow!("unknown agent {agent_id}"))?;
            if slot.handle.status.is_terminal() {
                return Err(anyhow!("agent {agent_id} already terminated"));
            }
            slot.handle.status = status;
            slot.handle.output = output;
            slot.handle.error = error;
            if slot.callback.is_none() {
                return Ok(());
            }
            match slots.remove(agent_id) {
                Some(AgentSlot {
                    handle,
                    callback: Some(callback),
                    ..
                }) => (handle, callback),
                _ => return Ok(()),
            }
        };
        callback(handle);
        Ok(())
    }

    pub fn set_callback(&self, agent_id: &str, callback: CompletionCallback) -> Result<()> {
        let fire_now = {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(agent_id)
                .ok_or_else(|| anyhow!("unknown agent {agent_id}"))?;
            if slot.callback_registered {
                return Err(anyhow!("completion callback already registered for {agent_id}"));
            }
            slot.callback_registered = true;
            if !slot.handle.status.is_terminal() {
                slot.callback = Some(callback);
                return Ok(());
            }
            slots.remove(agent_id).map(|slot| slot.handle)
        };
        if let Some(handle) = fire_now {
            debug!(agent_id, "agent already terminated, firing callback now");
            callback(handle);
        }
        Ok(())
    }

    pub fn is_running_in(&self, project_path: &Path) -> bool {
        self.lock().values().any(|slot| {
            slot.handle.status == AgentStatus::Running && slot.handle.project_path == project_path
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Executor that spawns the configured agent command per launch.
pub struct ProcessExecutor {
    config: AgentConfig,
    registry: Arc<AgentRegistry>,
}

impl ProcessExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            registry: Arc::new(AgentRegistry::default()),
        }
    }

    fn command(&self, project_path: &Path) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(project_path);
        Ok(cmd)
    }
}

impl AgentExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(project = %project_path.display()))]
    fn launch(&self, project_path: &Path, prompt: &str) -> Result<String> {
        if !project_path.is_dir() {
            return Err(anyhow!(
                "project path {} is not a directory",
                project_path.display()
            ));
        }
        let cmd = self.command(project_path)?;
        let running = spawn_command(cmd, Some(prompt.as_bytes()), self.config.output_limit_bytes)?;

        let agent_id = generate_id("agent");
        info!(agent_id = %agent_id, pid = running.id(), "agent started");
        self.registry
            .insert(AgentHandle::running(agent_id.clone(), project_path));

        let registry = Arc::clone(&self.registry);
        let timeout = self.config.timeout();
        let thread_id = agent_id.clone();
        thread::spawn(move || {
            let (status, output, error) = match running.wait_with_timeout(timeout) {
                Ok(out) => classify(&out),
                Err(err) => (AgentStatus::Failed, String::new(), Some(format!("{err:#}"))),
            };
            info!(agent_id = %thread_id, status = %status, "agent terminated");
            if let Err(err) = registry.finish(&thread_id, status, output, error) {
                warn!(agent_id = %thread_id, err = %err, "failed to record agent completion");
            }
        });

        Ok(agent_id)
    }

    fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.registry.get(agent_id)
    }

    fn set_completion_callback(&self, agent_id: &str, callback: CompletionCallback) -> Result<()> {
        self.registry.set_callback(agent_id, callback)
    }

    fn is_agent_running_in_folder(&self, project_path: &Path) -> bool {
        self.registry.is_running_in(project_path)
    }
}

fn classify(out: &CommandOutput) -> (AgentStatus, String, Option<String>) {
    let output = out.stdout_lossy();
    if out.timed_out {
        return (
            AgentStatus::Killed,
            output,
            Some("agent timed out and was killed".to_string()),
        );
    }
    if out.status.success() {
        return (AgentStatus::Finished, output, None);
    }
    let stderr = out.stderr_lossy();
    let mut error = match out.status.code() {
        Some(code) => format!("agent exited with status {code}"),
        None => "agent terminated by signal".to_string(),
    };
    if !stderr.trim().is_empty() {
        error.push_str(": ");
        error.push_str(stderr.trim());
    }
    (AgentStatus::Failed, output, Some(error))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn executor(script: &str, timeout_secs: u64) -> ProcessExecutor {
        ProcessExecutor::new(AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
            output_limit_bytes: 4096,
        })
    }

    fn run_to_completion(exec: &ProcessExecutor, dir: &Path, prompt: &str) -> AgentHandle {
        let id = exec.launch(dir, prompt).expect("launch");
        let (tx, rx) = mpsc::channel();
        exec.set_completion_callback(
            &id,
            Box::new(move |handle| {
                let _ = tx.send(handle);
            }),
        )
        .expect("callback");
        rx.recv_timeout(Duration::from_secs(20)).expect("completion")
    }

    #[test]
    fn zero_exit_finishes_with_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = executor("cat", 10);
        let handle = run_to_completion(&exec, temp.path(), "PRODUCTION READY");
        assert_eq!(handle.status, AgentStatus::Finished);
        assert_eq!(handle.output, "PRODUCTION READY");
        assert_eq!(handle.error, None);
        assert!(!exec.is_agent_running_in_folder(temp.path()));
        assert!(exec.get(&handle.id).is_none(), "reported agents are forgotten");
    }

    #[test]
    fn nonzero_exit_fails_with_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = executor("echo partial; echo boom >&2; exit 3", 10);
        let handle = run_to_completion(&exec, temp.path(), "");
        assert_eq!(handle.status, AgentStatus::Failed);
        assert_eq!(handle.output.trim(), "partial");
        let error = handle.error.expect("error");
        assert!(error.contains("status 3"), "{error}");
        assert!(error.contains("boom"), "{error}");
    }

    #[test]
    fn timeout_kills_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = executor("sleep 30", 1);
        let handle = run_to_completion(&exec, temp.path(), "");
        assert_eq!(handle.status, AgentStatus::Killed);
    }

    #[test]
    fn running_agent_is_visible_by_folder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = executor("sleep 2", 10);
        let id = exec.launch(temp.path(), "").expect("launch");
        assert!(exec.is_agent_running_in_folder(temp.path()));
        assert_eq!(exec.get(&id).expect("handle").status, AgentStatus::Running);
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ProcessExecutor::new(AgentConfig {
            command: vec!["/definitely/not/an/agent".to_string()],
            ..AgentConfig::default()
        });
        assert!(exec.launch(temp.path(), "prompt").is_err());
        assert!(!exec.is_agent_running_in_folder(temp.path()));
    }

    #[test]
    fn late_callback_fires_immediately_and_only_once() {
        let registry = AgentRegistry::default();
        registry.insert(AgentHandle::running("agent-1", "/p"));
        registry
            .finish("agent-1", AgentStatus::Finished, "done".to_string(), None)
            .expect("finish");

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        registry
            .set_callback(
                "agent-1",
                Box::new(move |h| {
                    let _ = tx.send(h.output);
                }),
            )
            .expect("register");
        assert_eq!(rx.try_recv().expect("fired"), "done");
        assert!(
            registry
                .set_callback(
                    "agent-1",
                    Box::new(move |h| {
                        let _ = tx2.send(h.output);
                    })
                )
                .is_err()
        );
        assert!(
            registry
                .finish("agent-1", AgentStatus::Failed, String::new(), None)
                .is_err()
        );
    }

    #[test]
    fn registry_forgets_agents_once_reported() {
        let registry = AgentRegistry::default();
        registry.insert(AgentHandle::running("agent-1", "/p"));
        registry.insert(AgentHandle::running("agent-2", "/p"));
        let (tx, rx) = mpsc::channel();
        registry
            .set_callback(
                "agent-1",
                Box::new(move |h| {
                    let _ = tx.send(h);
                }),
            )
            .expect("register");

        registry
            .finish("agent-1", AgentStatus::Finished, "done".to_string(), None)
            .expect("finish");
        assert_eq!(rx.try_recv().expect("fired").output, "done");
        assert!(registry.get("agent-1").is_none());

        // Terminal but unobserved: kept until someone registers.
        registry
            .finish("agent-2", AgentStatus::Killed, String::new(), None)
            .expect("finish");
        assert_eq!(
            registry.get("agent-2").expect("kept").status,
            AgentStatus::Killed
        );
        assert!(!registry.is_running_in(Path::new("/p")));
        registry
            .set_callback("agent-2", Box::new(|_| {}))
            .expect("register late");
        assert!(registry.get("agent-2").is_none());
    }
}
