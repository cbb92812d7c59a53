//! What the loop does after an agent terminates.
//!
//! Pure decision table; the controller performs the side effects.

use crate::core::types::{AgentStatus, IterationKind};

/// Token a test iteration emits when nothing is left to do.
pub const PRODUCTION_READY: &str = "PRODUCTION READY";

/// Next step for a soul after one of its iterations terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Abnormal termination: re-assess with a test iteration after a settle delay.
    RetestAfterDelay,
    /// Development finished: assess the result with a test iteration.
    Test,
    /// Judged ready but unfixed bugs remain: fix them first.
    FixBugs,
    /// Judged not ready: develop against the test output.
    Develop,
    /// Judged ready with zero unfixed bugs: stop looping and publish.
    Standby,
}

/// Exact-trim equality; a sentence merely mentioning the token does not count.
pub fn is_production_ready(output: &str) -> bool {
    output.trim() == PRODUCTION_READY
}

pub fn decide_next_step(
    kind: IterationKind,
    status: AgentStatus,
    output: &str,
    unfixed_bugs: usize,
) -> NextStep {
    if status.is_abnormal() {
        return NextStep::RetestAfterDelay;
    }
    match kind {
        IterationKind::Development => NextStep::Test,
        IterationKind::Test if !is_production_ready(output) => NextStep::Develop,
        IterationKind::Test if unfixed_bugs > 0 => NextStep::FixBugs,
        IterationKind::Test => NextStep::Standby,
    }
}

/// Transcript recorded on the iteration: the output, prefixed by the agent's
/// error message when it reported one.
pub fn iteration_result(output: &str, error: Option<&str>) -> String {
    match error.map(str::trim).filter(|e| !e.is_empty()) {
        Some(err) => format!("Error: {err}\n\n{output}"),
        None => output.to_string(),
    }
}
