//! Test-only helpers: a scripted executor, a recording publisher and
//! store/soul builders.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};

use crate::core::soul::{Bug, Soul};
use crate::core::types::{AgentStatus, BugStatus, Severity, SoulStatus};
use crate::io::config::LoopConfig;
use crate::io::executor::{AgentExecutor, AgentHandle, AgentRegistry, CompletionCallback};
use crate::io::git::Publisher;
use crate::io::store::SoulStore;

/// One recorded `launch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub agent_id: String,
    pub project_path: PathBuf,
    pub prompt: String,
}

/// Executor that never spawns anything.
///
/// Agents stay `running` until [`ScriptedExecutor::finish`] is called, unless
/// an outcome was queued with [`ScriptedExecutor::push_outcome`]: the next
/// launch then terminates as soon as its callback is registered.
#[derive(Default)]
pub struct ScriptedExecutor {
    registry: AgentRegistry,
    launches: Mutex<Vec<Launch>>,
    outcomes: Mutex<VecDeque<(AgentStatus, String)>>,
    scripted: Mutex<HashMap<String, (AgentStatus, String)>>,
    fail_next: AtomicBool,
    counter: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next launch that has none yet.
    pub fn push_outcome(&self, status: AgentStatus, output: &str) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back((status, output.to_string()));
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Terminate a running agent, firing its callback if registered.
    pub fn finish(&self, agent_id: &str, status: AgentStatus, output: &str) {
        let error = status
            .is_abnormal()
            .then(|| format!("agent {status}"));
        self.registry
            .finish(agent_id, status, output.to_string(), error)
            .expect("finish scripted agent");
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().expect("launches lock").clone()
    }

    pub fn last_launch(&self) -> Launch {
        self.launches().pop().expect("at least one launch")
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn launch(&self, project_path: &Path, prompt: &str) -> Result<String> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("scripted launch failure"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let agent_id = format!("agent-{n}");
        self.registry
            .insert(AgentHandle::running(agent_id.clone(), project_path));
        self.launches.lock().expect("launches lock").push(Launch {
            agent_id: agent_id.clone(),
            project_path: project_path.to_path_buf(),
            prompt: prompt.to_string(),
        });
        if let Some(outcome) = self.outcomes.lock().expect("outcomes lock").pop_front() {
            self.scripted
                .lock()
                .expect("scripted lock")
                .insert(agent_id.clone(), outcome);
        }
        Ok(agent_id)
    }

    fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.registry.get(agent_id)
    }

    fn set_completion_callback(&self, agent_id: &str, callback: CompletionCallback) -> Result<()> {
        self.registry.set_callback(agent_id, callback)?;
        let scripted = self.scripted.lock().expect("scripted lock").remove(agent_id);
        if let Some((status, output)) = scripted {
            self.finish(agent_id, status, &output);
        }
        Ok(())
    }

    fn is_agent_running_in_folder(&self, project_path: &Path) -> bool {
        self.registry.is_running_in(project_path)
    }
}

/// Publisher that records project paths instead of pushing.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PathBuf>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<PathBuf> {
        self.published.lock().expect("published lock").clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, project_path: &Path) -> Result<()> {
        self.published
            .lock()
            .expect("published lock")
            .push(project_path.to_path_buf());
        Ok(())
    }
}

/// Store in a fresh temp directory. Keep the `TempDir` alive for the test.
pub fn temp_store() -> (tempfile::TempDir, Arc<SoulStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SoulStore::open(dir.path()).expect("open store");
    (dir, Arc::new(store))
}

/// Config with no re-test delay and publishing on.
pub fn test_config() -> LoopConfig {
    LoopConfig {
        retest_delay_secs: 0,
        ..LoopConfig::default()
    }
}

/// Persist a `Working` soul with one objective.
pub fn working_soul(store: &SoulStore, project_path: &str) -> Soul {
    let mut soul = Soul::new(project_path, "");
    soul.set_objectives(vec!["users can manage todos".to_string()]);
    soul.set_status(SoulStatus::Working);
    store.create(&soul).expect("create soul");
    soul
}

pub fn open_bug(id: &str, description: &str, severity: Severity) -> Bug {
    Bug {
        id: id.to_string(),
        description: description.to_string(),
        severity,
        status: BugStatus::Open,
        found_at: chrono::Utc::now(),
        fixed_at: None,
        agent_id: "agent-0".to_string(),
    }
}
