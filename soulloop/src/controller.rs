//! Iteration controller: chains agent runs into a development cycle per soul.
//!
//! Executor callbacks never run loop logic themselves. They post a
//! [`LoopEvent`] on a channel and a single consumer ([`Controller::process_next`]
//! or [`Controller::run_until_idle`]) handles events one at a time, so
//! continuations for the same soul are serialized by construction.
//!
//! Per soul the cycle is:
//!
//! - development finished → test iteration
//! - test says `PRODUCTION READY`, no open bugs → `Standby` + publish
//! - test says `PRODUCTION READY`, open bugs → bug-fix development iteration
//! - test lists issues → development iteration fed with that output
//! - any iteration failed or killed → test iteration after a settle delay
//!
//! The pause flag is checked before every launch; a paused loop simply stops
//! chaining and [`Controller::set_paused`] repairs interrupted souls on resume.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::decision::{NextStep, decide_next_step, iteration_result};
use crate::core::extractor::extract_feedback;
use crate::core::soul::{Soul, TestResult};
use crate::core::types::{IterationKind, SoulStatus};
use crate::io::config::LoopConfig;
use crate::io::executor::{AgentExecutor, AgentHandle};
use crate::io::git::Publisher;
use crate::io::prompt::PromptEngine;
use crate::io::store::{SoulStore, StoreError};

/// Name of the failing test result recorded when a test run is not ready.
pub const READINESS_TEST_NAME: &str = "Production Readiness Test";

const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The executor could not start the agent. Not retried.
    #[error("failed to launch agent for soul {soul_id}")]
    ExecutionFailure {
        soul_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("soul {soul_id} already has an agent in flight ({agent_id})")]
    AlreadyRunning { soul_id: String, agent_id: String },
}

/// Work delivered to the single loop consumer.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    AgentFinished(AgentHandle),
    Retest { soul_id: String },
}

#[derive(Debug, Clone)]
struct InFlight {
    soul_id: String,
    kind: IterationKind,
}

#[derive(Debug, Default)]
struct LoopState {
    /// Keyed by agent id.
    in_flight: HashMap<String, InFlight>,
    pending_retests: usize,
}

impl LoopState {
    /// `AlreadyRunning` if this loop has an agent in flight for `soul_id`.
    fn ensure_idle(&self, soul_id: &str) -> Result<(), LoopError> {
        match self
            .in_flight
            .iter()
            .find(|(_, flight)| flight.soul_id == soul_id)
        {
            Some((agent_id, _)) => Err(LoopError::AlreadyRunning {
                soul_id: soul_id.to_string(),
                agent_id: agent_id.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Which prompt a launch renders.
enum LaunchPlan<'a> {
    Development { feedback: Option<&'a str> },
    BugFix,
    Test,
}

impl LaunchPlan<'_> {
    fn kind(&self) -> IterationKind {
        match self {
            Self::Development { .. } | Self::BugFix => IterationKind::Development,
            Self::Test => IterationKind::Test,
        }
    }
}

pub struct Controller<E: AgentExecutor, P: Publisher + ?Sized + 'static> {
    store: Arc<SoulStore>,
    executor: Arc<E>,
    publisher: Arc<P>,
    prompts: PromptEngine,
    config: LoopConfig,
    events_tx: Sender<LoopEvent>,
    events_rx: Mutex<Receiver<LoopEvent>>,
    state: Mutex<LoopState>,
    publishes: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: AgentExecutor, P: Publisher + ?Sized + 'static> Controller<E, P> {
    pub fn new(
        store: Arc<SoulStore>,
        executor: Arc<E>,
        publisher: Arc<P>,
        config: LoopConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            store,
            executor,
            publisher,
            prompts: PromptEngine::new(),
            config,
            events_tx,
            events_rx: Mutex::new(events_rx),
            state: Mutex::new(LoopState::default()),
            publishes: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &SoulStore {
        &self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Launch a development iteration.
    ///
    /// `feedback` is the test output the agent should work from. Without it
    /// the output of the soul's last completed test iteration is used, if
    /// any. Returns the agent id, or `None` when the loop is paused.
    pub fn launch_development(
        &self,
        soul_id: &str,
        feedback: Option<&str>,
    ) -> Result<Option<String>, LoopError> {
        self.launch(soul_id, LaunchPlan::Development { feedback })
    }

    /// Launch a test iteration. Returns `None` when the loop is paused.
    pub fn launch_test(&self, soul_id: &str) -> Result<Option<String>, LoopError> {
        self.launch(soul_id, LaunchPlan::Test)
    }

    /// Launch a development iteration focused on the soul's unfixed bugs.
    pub fn launch_bugfix(&self, soul_id: &str) -> Result<Option<String>, LoopError> {
        self.launch(soul_id, LaunchPlan::BugFix)
    }

    #[instrument(skip_all, fields(soul_id = %soul_id, kind = %plan.kind()))]
    fn launch(&self, soul_id: &str, plan: LaunchPlan<'_>) -> Result<Option<String>, LoopError> {
        if self.store.is_paused() {
            info!("loop paused, not launching");
            return Ok(None);
        }
        let kind = plan.kind();

        // Held across the whole launch so a completion cannot be handled
        // before its iteration is recorded.
        let mut state = self.lock_state();
        state.ensure_idle(soul_id)?;

        // Another process sharing the store may own an agent for this soul.
        if let Some(open) = self.store.get(soul_id)?.open_iteration() {
            return Err(LoopError::AlreadyRunning {
                soul_id: soul_id.to_string(),
                agent_id: open.agent_id.clone(),
            });
        }

        let soul = self.store.set_status(soul_id, SoulStatus::Working)?;
        let prompt = self
            .render(&soul, &plan)
            .map_err(|source| execution_failure(soul_id, source))?;
        let agent_id = self
            .executor
            .launch(&soul.project_path, &prompt)
            .map_err(|source| execution_failure(soul_id, source))?;

        let recorded = self.store.modify(soul_id, |soul| {
            soul.start_iteration(&agent_id, kind);
        });

        state.in_flight.insert(
            agent_id.clone(),
            InFlight {
                soul_id: soul_id.to_string(),
                kind,
            },
        );
        let tx = self.events_tx.clone();
        let registered = self.executor.set_completion_callback(
            &agent_id,
            Box::new(move |handle| {
                if tx.send(LoopEvent::AgentFinished(handle)).is_err() {
                    debug!("loop consumer gone, dropping completion");
                }
            }),
        );
        if let Err(source) = registered {
            state.in_flight.remove(&agent_id);
            let message = format!("{source:#}");
            let reason = iteration_result("", Some(message.as_str()));
            if let Err(err) = self.store.modify(soul_id, |soul| {
                soul.complete_iteration(&agent_id, &reason);
            }) {
                warn!(agent_id = %agent_id, err = %err, "failed to close unwatched iteration");
            }
            return Err(execution_failure(soul_id, source));
        }
        let soul = recorded?;

        let number = soul
            .iteration_for_agent(&agent_id)
            .map(|it| it.number)
            .unwrap_or_default();
        info!(agent_id = %agent_id, iteration = number, "iteration launched");
        Ok(Some(agent_id))
    }

    fn render(&self, soul: &Soul, plan: &LaunchPlan<'_>) -> anyhow::Result<String> {
        match plan {
            LaunchPlan::Development { feedback } => {
                let feedback = feedback.or_else(|| soul.last_test_output());
                self.prompts.render_development(soul, feedback)
            }
            LaunchPlan::BugFix => {
                let bugs = soul.unfixed_bugs();
                self.prompts.render_bugfix(soul, &bugs)
            }
            LaunchPlan::Test => self.prompts.render_test(soul),
        }
    }

    /// Handle at most one event, waiting up to `timeout` for it.
    ///
    /// Returns `false` if nothing arrived in time.
    pub fn process_next(&self, timeout: Duration) -> bool {
        let event = {
            let rx = self
                .events_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match rx.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        };
        self.handle_event(event);
        true
    }

    /// Drive the loop until no agent is in flight and no re-test is scheduled.
    pub fn run_until_idle(&self) {
        while !self.is_idle() {
            self.process_next(IDLE_POLL);
        }
        debug!("loop idle");
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.in_flight.is_empty() && state.pending_retests == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    /// Block until every publish started so far has finished.
    pub fn wait_for_publishes(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut publishes = self
                .publishes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            publishes.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("publish thread panicked");
            }
        }
    }

    /// Close iterations left open by an agent nobody is waiting for, such as
    /// one whose `run` process died. Returns how many were closed.
    ///
    /// Refuses while this controller has the soul's agent in flight.
    pub fn abandon_open_iterations(&self, soul_id: &str) -> Result<usize, LoopError> {
        let state = self.lock_state();
        state.ensure_idle(soul_id)?;
        let reason = iteration_result("", Some("iteration abandoned"));
        let mut closed = 0;
        self.store.modify(soul_id, |soul| {
            closed = soul.abandon_open_iterations(&reason);
        })?;
        if closed > 0 {
            warn!(soul_id, closed, "abandoned open iterations");
        }
        Ok(closed)
    }

    /// Persist the pause flag.
    ///
    /// On a paused → running transition every `Working` soul with no agent
    /// running in its folder and no open iteration in the store gets a fresh
    /// test iteration. Returns the ids of the souls relaunched.
    pub fn set_paused(&self, paused: bool) -> anyhow::Result<Vec<String>> {
        let was_paused = self.store.is_paused();
        self.store
            .set_paused(paused)
            .context("persist pause flag")?;
        info!(paused, "pause flag updated");
        if was_paused && !paused {
            return self.reconcile_interrupted();
        }
        Ok(Vec::new())
    }

    #[instrument(skip_all)]
    fn reconcile_interrupted(&self) -> anyhow::Result<Vec<String>> {
        let working = self
            .store
            .list_by_status(SoulStatus::Working)
            .context("list working souls")?;
        let mut relaunched = Vec::new();
        for soul in working {
            if self.executor.is_agent_running_in_folder(&soul.project_path) {
                debug!(soul_id = %soul.id, "agent still running, leaving soul alone");
                continue;
            }
            if let Some(open) = soul.open_iteration() {
                debug!(
                    soul_id = %soul.id,
                    agent_id = %open.agent_id,
                    "iteration still open, leaving soul alone"
                );
                continue;
            }
            match self.launch_test(&soul.id) {
                Ok(Some(_)) => relaunched.push(soul.id),
                Ok(None) => {}
                Err(LoopError::AlreadyRunning { .. }) => {}
                Err(err) => {
                    warn!(soul_id = %soul.id, err = %error_chain(&err), "resume relaunch failed");
                }
            }
        }
        info!(count = relaunched.len(), "resumed interrupted souls");
        Ok(relaunched)
    }

    fn handle_event(&self, event: LoopEvent) {
        match event {
            LoopEvent::AgentFinished(handle) => self.handle_completion(&handle),
            LoopEvent::Retest { soul_id } => {
                {
                    let mut state = self.lock_state();
                    state.pending_retests = state.pending_retests.saturating_sub(1);
                }
                if self.store.is_paused() {
                    info!(soul_id = %soul_id, "paused, dropping scheduled re-test");
                    return;
                }
                self.launch_logged(&soul_id, LaunchPlan::Test);
            }
        }
    }

    #[instrument(skip_all, fields(agent_id = %handle.id, status = %handle.status))]
    fn handle_completion(&self, handle: &AgentHandle) {
        let Some(flight) = self.lock_state().in_flight.remove(&handle.id) else {
            warn!("completion for an agent this loop did not launch");
            return;
        };
        let soul_id = flight.soul_id.as_str();

        let result = iteration_result(&handle.output, handle.error.as_deref());
        let extracted = extract_feedback(&result, &handle.id, Utc::now());
        debug!(
            soul_id,
            features = extracted.features.len(),
            bugs = extracted.bugs.len(),
            tests = extracted.test_results.len(),
            "extracted feedback"
        );
        let soul = match self.store.modify(soul_id, |soul| {
            soul.complete_iteration(&handle.id, &result);
            for feature in extracted.features {
                soul.add_implemented_feature(feature);
            }
            for bug in extracted.bugs {
                soul.add_bug(bug);
            }
            for test in extracted.test_results {
                soul.add_test_result(test);
            }
        }) {
            Ok(soul) => soul,
            Err(err) => {
                error!(soul_id, err = %err, "failed to record iteration completion");
                return;
            }
        };

        let open_bugs = soul.unfixed_bugs().len();
        let next = decide_next_step(flight.kind, handle.status, &handle.output, open_bugs);
        info!(soul_id, kind = %flight.kind, ?next, open_bugs, "iteration completed");

        match next {
            NextStep::RetestAfterDelay => {
                if self.store.is_paused() {
                    info!(soul_id, "paused, not scheduling re-test");
                    return;
                }
                self.schedule_retest(soul_id);
            }
            NextStep::Test => self.launch_logged(soul_id, LaunchPlan::Test),
            NextStep::Develop => {
                let failing = TestResult {
                    test_name: READINESS_TEST_NAME.to_string(),
                    passed: false,
                    message: handle.output.clone(),
                    executed_at: Utc::now(),
                    agent_id: handle.id.clone(),
                };
                if let Err(err) = self.store.add_test_result(soul_id, failing) {
                    error!(soul_id, err = %err, "failed to record readiness result");
                }
                self.launch_logged(
                    soul_id,
                    LaunchPlan::Development {
                        feedback: Some(handle.output.as_str()),
                    },
                );
            }
            NextStep::FixBugs => self.launch_logged(soul_id, LaunchPlan::BugFix),
            NextStep::Standby => match self.store.set_status(soul_id, SoulStatus::Standby) {
                Ok(soul) => {
                    info!(soul_id, "soul is production ready");
                    self.spawn_publish(&soul);
                }
                Err(err) => error!(soul_id, err = %err, "failed to settle soul"),
            },
        }
    }

    /// Launch from a continuation. Failures are logged, never retried.
    fn launch_logged(&self, soul_id: &str, plan: LaunchPlan<'_>) {
        if let Err(err) = self.launch(soul_id, plan) {
            warn!(soul_id, err = %error_chain(&err), "follow-up launch failed");
        }
    }

    fn schedule_retest(&self, soul_id: &str) {
        self.lock_state().pending_retests += 1;
        let delay = self.config.retest_delay();
        let tx = self.events_tx.clone();
        let soul_id = soul_id.to_string();
        debug!(soul_id = %soul_id, delay_secs = delay.as_secs(), "scheduling re-test");
        thread::spawn(move || {
            thread::sleep(delay);
            if tx.send(LoopEvent::Retest { soul_id }).is_err() {
                debug!("loop consumer gone, dropping re-test");
            }
        });
    }

    fn spawn_publish(&self, soul: &Soul) {
        let publisher = Arc::clone(&self.publisher);
        let soul_id = soul.id.clone();
        let project_path = soul.project_path.clone();
        let handle = thread::spawn(move || {
            if let Err(err) = publisher.publish(&project_path) {
                let message = format!("{err:#}");
                warn!(soul_id = %soul_id, err = %message, "publish failed");
            }
        });
        self.publishes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `err` and its sources joined with `: `.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn execution_failure(soul_id: &str, source: anyhow::Error) -> LoopError {
    LoopError::ExecutionFailure {
        soul_id: soul_id.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentStatus;
    use crate::test_support::{RecordingPublisher, ScriptedExecutor, temp_store, test_config};

    type TestController = Controller<ScriptedExecutor, RecordingPublisher>;

    fn controller() -> (tempfile::TempDir, TestController) {
        let (dir, store) = temp_store();
        let controller = Controller::new(
            store,
            Arc::new(ScriptedExecutor::new()),
            Arc::new(RecordingPublisher::default()),
            test_config(),
        );
        (dir, controller)
    }

    fn create_soul(controller: &TestController, path: &str) -> Soul {
        let soul = Soul::new(path, "");
        controller.store().create(&soul).expect("create");
        soul
    }

    #[test]
    fn launch_marks_working_and_records_iteration() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");

        let agent_id = controller
            .launch_development(&soul.id, None)
            .expect("launch")
            .expect("not paused");

        let stored = controller.store().get(&soul.id).expect("get");
        assert_eq!(stored.status, SoulStatus::Working);
        assert_eq!(stored.iterations.len(), 1);
        assert_eq!(stored.iterations[0].agent_id, agent_id);
        assert_eq!(stored.iterations[0].kind, IterationKind::Development);
        assert_eq!(controller.in_flight_count(), 1);
    }

    #[test]
    fn second_launch_for_same_soul_is_rejected() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        controller.launch_test(&soul.id).expect("first");

        let err = controller.launch_test(&soul.id).unwrap_err();
        assert!(matches!(err, LoopError::AlreadyRunning { .. }), "{err}");
        assert_eq!(controller.store().get(&soul.id).expect("get").iterations.len(), 1);
    }

    #[test]
    fn paused_launch_is_silent_noop() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        controller.set_paused(true).expect("pause");

        assert_eq!(controller.launch_development(&soul.id, None).expect("launch"), None);
        let stored = controller.store().get(&soul.id).expect("get");
        assert_eq!(stored.status, SoulStatus::Standby);
        assert!(stored.iterations.is_empty());
    }

    #[test]
    fn launch_failure_is_reported_and_not_retried() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        controller.executor().fail_next_launch();

        let err = controller.launch_development(&soul.id, None).unwrap_err();
        assert!(matches!(err, LoopError::ExecutionFailure { .. }), "{err}");
        assert!(controller.is_idle());
        let stored = controller.store().get(&soul.id).expect("get");
        assert_eq!(stored.status, SoulStatus::Working);
        assert!(stored.iterations.is_empty());
    }

    #[test]
    fn missing_soul_is_not_found() {
        let (_dir, controller) = controller();
        let err = controller.launch_test("soul-missing").unwrap_err();
        assert!(matches!(err, LoopError::Store(StoreError::NotFound(_))), "{err}");
    }

    #[test]
    fn finished_development_is_followed_by_test() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        let agent_id = controller
            .launch_development(&soul.id, None)
            .expect("launch")
            .expect("agent");

        controller
            .executor()
            .finish(&agent_id, AgentStatus::Finished, "Implemented login page");
        assert!(controller.process_next(Duration::from_secs(5)));

        let stored = controller.store().get(&soul.id).expect("get");
        assert_eq!(stored.iterations.len(), 2);
        assert!(stored.iterations[0].completed_at.is_some());
        assert_eq!(stored.iterations[1].kind, IterationKind::Test);
        assert_eq!(stored.feedback.implemented_features.len(), 1);
        let launches = controller.executor().launches();
        assert!(launches[1].prompt.contains("PRODUCTION READY"));
    }

    #[test]
    fn not_ready_records_failing_readiness_result_and_develops() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        let agent_id = controller.launch_test(&soul.id).expect("launch").expect("agent");

        let report = "1. signup form does not validate email";
        controller
            .executor()
            .finish(&agent_id, AgentStatus::Finished, report);
        assert!(controller.process_next(Duration::from_secs(5)));

        let stored = controller.store().get(&soul.id).expect("get");
        let readiness: Vec<_> = stored
            .feedback
            .test_results
            .iter()
            .filter(|r| r.test_name == READINESS_TEST_NAME)
            .collect();
        assert_eq!(readiness.len(), 1);
        assert!(!readiness[0].passed);
        assert_eq!(readiness[0].message, report);
        assert_eq!(stored.iterations[1].kind, IterationKind::Development);
        let launches = controller.executor().launches();
        assert!(launches[1].prompt.contains(report));
    }

    #[test]
    fn resume_relaunches_interrupted_working_souls() {
        let (_dir, controller) = controller();
        let soul = create_soul(&controller, "/work/todo");
        let idle = create_soul(&controller, "/work/idle");
        let agent_id = controller
            .launch_development(&soul.id, None)
            .expect("launch")
            .expect("agent");

        controller.set_paused(true).expect("pause");
        controller
            .executor()
            .finish(&agent_id, AgentStatus::Finished, "Implemented search");
        assert!(controller.process_next(Duration::from_secs(5)));
        assert!(controller.is_idle());

        let relaunched = controller.set_paused(false).expect("resume");
        assert_eq!(relaunched, vec![soul.id.clone()]);
        let stored = controller.store().get(&soul.id).expect("get");
        assert_eq!(stored.iterations.last().expect("iteration").kind, IterationKind::Test);
        assert!(controller.store().get(&idle.id).expect("get").iterations.is_empty());
    }
}
