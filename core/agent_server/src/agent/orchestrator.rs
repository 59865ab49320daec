//! Run state machine: one active run per session, strict step ordering,
//! and the recovery actions that mutate a plan mid-flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shared_types::{
    Plan, RunStatus, SessionId, Step, StepDraft, StepState, ToolCall,
};

use crate::error::AgentServerError;

/// Everything the orchestrator tracks for one in-flight run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub original_request: String,
    pub notebook: shared_types::NotebookContext,
    pub detected_libraries: Vec<String>,
    pub plan: Plan,
    /// 0-based index of the step currently with the executor.
    pub current: usize,
    pub step_states: Vec<StepState>,
    /// Refinement attempts for the current step; resets on advance.
    pub refine_attempts: u32,
    pub replan_events: u32,
    pub installed_packages: Vec<String>,
    pub outputs: Vec<String>,
    pub status: RunStatus,
}

impl RunState {
    pub fn new(
        original_request: String,
        notebook: shared_types::NotebookContext,
        detected_libraries: Vec<String>,
        plan: Plan,
    ) -> Self {
        let step_states = vec![StepState::Pending; plan.steps.len()];
        let installed_packages = notebook.installed_packages.clone();
        let mut state = Self {
            original_request,
            notebook,
            detected_libraries,
            plan,
            current: 0,
            step_states,
            refine_attempts: 0,
            replan_events: 0,
            installed_packages,
            outputs: Vec::new(),
            status: RunStatus::Running,
        };
        if !state.step_states.is_empty() {
            state.step_states[0] = StepState::Dispatched;
        }
        state
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.steps.get(self.current)
    }

    /// A step may not start until all its dependencies completed.
    pub fn dependencies_satisfied(&self, step: &Step) -> bool {
        step.dependencies.iter().all(|&dep| {
            self.plan
                .steps
                .iter()
                .position(|s| s.step_number == dep)
                .map(|idx| self.step_states[idx] == StepState::Completed)
                .unwrap_or(false)
        })
    }

    /// Record a successful step and move the cursor forward. Returns the
    /// next step to dispatch, or `None` when the plan is exhausted.
    pub fn complete_current(&mut self, output: String) -> Option<Step> {
        if self.current < self.step_states.len() {
            self.step_states[self.current] = StepState::Completed;
        }
        if !output.is_empty() {
            self.outputs.push(output);
        }
        self.refine_attempts = 0;
        self.current += 1;

        match self.plan.steps.get(self.current) {
            Some(step) => {
                self.step_states[self.current] = StepState::Dispatched;
                Some(step.clone())
            }
            None => {
                self.status = RunStatus::Completed;
                None
            }
        }
    }

    /// The final answer text carried by the plan's terminal step, once it
    /// has executed.
    pub fn final_answer(&self) -> Option<String> {
        self.plan.steps.iter().rev().find_map(|step| {
            step.tool_calls.iter().find_map(|tc| match tc {
                ToolCall::FinalAnswer { answer, .. } => Some(answer.clone()),
                _ => None,
            })
        })
    }

    /// Splice recovery steps in front of the failed step; the failed step
    /// retries after they finish. Returns the first inserted step.
    pub fn insert_steps(&mut self, drafts: Vec<StepDraft>) -> Option<Step> {
        if drafts.is_empty() {
            return None;
        }
        let at = self.current;
        for (offset, draft) in drafts.into_iter().enumerate() {
            let idx = at + offset;
            self.plan.steps.insert(
                idx,
                Step {
                    step_number: 0, // renumbered below
                    description: draft.description,
                    tool_calls: draft.tool_calls,
                    dependencies: Vec::new(),
                    checkpoint: None,
                    risk_level: None,
                },
            );
            self.step_states.insert(idx, StepState::Pending);
        }
        self.plan.renumber();
        self.refine_attempts = 0;
        self.step_states[self.current] = StepState::Dispatched;
        self.current_step().cloned()
    }

    /// Swap in the refined tool calls for the failed step and re-dispatch.
    pub fn replace_current_tool_calls(&mut self, tool_calls: Vec<ToolCall>) -> Option<Step> {
        let step = self.plan.steps.get_mut(self.current)?;
        step.tool_calls = tool_calls;
        self.step_states[self.current] = StepState::Dispatched;
        self.current_step().cloned()
    }

    /// Replace the failed step wholesale with a different approach.
    pub fn replace_current_step(&mut self, draft: StepDraft) -> Option<Step> {
        let step = self.plan.steps.get_mut(self.current)?;
        step.description = draft.description;
        step.tool_calls = draft.tool_calls;
        self.step_states[self.current] = StepState::Dispatched;
        self.refine_attempts = 0;
        self.current_step().cloned()
    }

    /// Rewrite the plan suffix from the failed step onward, keeping the
    /// executed prefix untouched. The new tail must end in a final answer;
    /// one is appended when the replanner forgot it.
    pub fn replan_remaining(&mut self, drafts: Vec<StepDraft>) -> Option<Step> {
        if drafts.is_empty() {
            return None;
        }

        self.plan.steps.truncate(self.current);
        self.step_states.truncate(self.current);

        for draft in drafts {
            self.plan.steps.push(Step {
                step_number: 0,
                description: draft.description,
                tool_calls: draft.tool_calls,
                dependencies: Vec::new(),
                checkpoint: None,
                risk_level: None,
            });
            self.step_states.push(StepState::Pending);
        }

        let has_final = self.plan.steps[self.current..]
            .iter()
            .any(Step::has_final_answer);
        if !has_final {
            self.plan.steps.push(Step {
                step_number: 0,
                description: "Present the final result".to_string(),
                tool_calls: vec![ToolCall::final_answer(
                    "The remaining steps completed after replanning.",
                )],
                dependencies: Vec::new(),
                checkpoint: None,
                risk_level: None,
            });
            self.step_states.push(StepState::Pending);
        }

        self.plan.renumber();
        self.refine_attempts = 0;
        self.replan_events += 1;
        self.step_states[self.current] = StepState::Dispatched;
        self.current_step().cloned()
    }

    /// Recovery bounds ran out: drop the unfinished tail and emit one
    /// terminal final_answer step summarizing what did complete.
    pub fn synthesize_final_step(&mut self, reason: &str) -> Step {
        let completed = self
            .step_states
            .iter()
            .filter(|s| **s == StepState::Completed)
            .count();
        let total = self.plan.total_steps;

        let mut answer = format!(
            "Stopped early: {reason}. Completed {completed} of {total} planned steps."
        );
        if !self.outputs.is_empty() {
            answer.push_str(" Last output: ");
            let last = self.outputs.last().map(String::as_str).unwrap_or("");
            answer.push_str(&last.chars().take(200).collect::<String>());
        }

        self.plan.steps.truncate(self.current);
        self.step_states.truncate(self.current);
        self.plan.steps.push(Step {
            step_number: 0,
            description: "Summarize completed work".to_string(),
            tool_calls: vec![ToolCall::final_answer(answer)],
            dependencies: Vec::new(),
            checkpoint: None,
            risk_level: None,
        });
        self.step_states.push(StepState::Dispatched);
        self.plan.renumber();

        self.current = self.plan.steps.len() - 1;
        self.current_step().cloned().expect("synthesized step exists")
    }

    pub fn mark_failed(&mut self) {
        if self.current < self.step_states.len() {
            self.step_states[self.current] = StepState::Failed;
        }
    }

    pub fn mark_recovering(&mut self) {
        if self.current < self.step_states.len() {
            self.step_states[self.current] = StepState::Recovering;
        }
    }
}

/// Session-keyed registry of in-flight runs. The outer map lock is short;
/// each run has its own async mutex so one session's recovery (which may
/// await LLM calls) never blocks another session.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<RunState>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run. A session may have at most one that is still
    /// running.
    pub fn start(&self, session_id: &str, state: RunState) -> Result<(), AgentServerError> {
        let mut runs = self.runs.lock().expect("run registry lock poisoned");

        if let Some(existing) = runs.get(session_id) {
            // try_lock: a held lock means the run is actively advancing.
            let busy = match existing.try_lock() {
                Ok(run) => run.status == RunStatus::Running,
                Err(_) => true,
            };
            if busy {
                return Err(AgentServerError::InvalidInput(format!(
                    "session '{session_id}' already has a run in flight"
                )));
            }
        }

        runs.insert(
            session_id.to_string(),
            Arc::new(tokio::sync::Mutex::new(state)),
        );
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<tokio::sync::Mutex<RunState>>> {
        self.runs
            .lock()
            .expect("run registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.runs
            .lock()
            .expect("run registry lock poisoned")
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::NotebookContext;

    fn step(number: u32, description: &str, call: ToolCall) -> Step {
        Step {
            step_number: number,
            description: description.to_string(),
            tool_calls: vec![call],
            dependencies: if number > 1 { vec![number - 1] } else { vec![] },
            checkpoint: None,
            risk_level: None,
        }
    }

    fn three_step_plan() -> Plan {
        Plan {
            total_steps: 3,
            steps: vec![
                step(1, "load data", ToolCall::jupyter_cell("df = dd.read_csv('t.csv')")),
                step(2, "show head", ToolCall::jupyter_cell("df.head().compute()")),
                step(3, "finish", ToolCall::final_answer("done")),
            ],
        }
    }

    fn run() -> RunState {
        RunState::new(
            "load with dask".into(),
            NotebookContext::default(),
            vec!["dask".into()],
            three_step_plan(),
        )
    }

    #[test]
    fn new_run_dispatches_first_step() {
        let run = run();
        assert_eq!(run.step_states[0], StepState::Dispatched);
        assert_eq!(run.current_step().unwrap().step_number, 1);
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn completing_steps_advances_to_terminal() {
        let mut run = run();

        let next = run.complete_current("loaded".into()).unwrap();
        assert_eq!(next.step_number, 2);
        assert_eq!(run.step_states[0], StepState::Completed);

        let next = run.complete_current("head shown".into()).unwrap();
        assert_eq!(next.step_number, 3);

        assert!(run.complete_current(String::new()).is_none());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.final_answer().as_deref(), Some("done"));
    }

    #[test]
    fn dependencies_gate_on_completed_state() {
        let mut run = run();
        let second = run.plan.steps[1].clone();
        assert!(!run.dependencies_satisfied(&second));

        run.complete_current(String::new());
        let second = run.plan.steps[1].clone();
        assert!(run.dependencies_satisfied(&second));
    }

    #[test]
    fn insert_steps_splices_before_failed_step_and_retries_it() {
        let mut run = run();
        run.mark_failed();

        let first = run
            .insert_steps(vec![StepDraft {
                description: "Install the pyarrow package".into(),
                tool_calls: vec![ToolCall::jupyter_cell("!pip install --timeout 180 pyarrow")],
            }])
            .unwrap();

        assert_eq!(first.step_number, 1);
        assert!(first.code().unwrap().starts_with("!pip install"));
        assert_eq!(run.plan.total_steps, 4);
        // The original failed step follows the install and keeps its code.
        assert_eq!(
            run.plan.steps[1].code().unwrap(),
            "df = dd.read_csv('t.csv')"
        );
        assert!(run.plan.validate().is_ok());

        // After the install completes, the original step is re-dispatched.
        let retried = run.complete_current(String::new()).unwrap();
        assert_eq!(retried.code().unwrap(), "df = dd.read_csv('t.csv')");
    }

    #[test]
    fn refine_replaces_tool_calls_in_place() {
        let mut run = run();
        run.mark_recovering();

        let updated = run
            .replace_current_tool_calls(vec![ToolCall::jupyter_cell(
                "df = dd.read_csv('t.csv', encoding='cp949')",
            )])
            .unwrap();

        assert_eq!(updated.step_number, 1);
        assert!(updated.code().unwrap().contains("encoding="));
        assert_eq!(run.plan.total_steps, 3);
    }

    #[test]
    fn replan_remaining_keeps_executed_prefix() {
        let mut run = run();
        run.complete_current("ok".into());
        run.mark_failed();

        let next = run
            .replan_remaining(vec![
                StepDraft {
                    description: "alternate load".into(),
                    tool_calls: vec![ToolCall::jupyter_cell("df = pd.read_csv('t.csv')")],
                },
                StepDraft {
                    description: "finish".into(),
                    tool_calls: vec![ToolCall::final_answer("loaded with pandas")],
                },
            ])
            .unwrap();

        assert_eq!(next.step_number, 2);
        assert_eq!(run.plan.total_steps, 3);
        // The executed first step is untouched.
        assert_eq!(run.plan.steps[0].code().unwrap(), "df = dd.read_csv('t.csv')");
        assert_eq!(run.step_states[0], StepState::Completed);
        assert_eq!(run.replan_events, 1);
        assert!(run.plan.validate().is_ok());
    }

    #[test]
    fn replan_remaining_appends_missing_final_answer() {
        let mut run = run();
        run.mark_failed();

        run.replan_remaining(vec![StepDraft {
            description: "only a code step".into(),
            tool_calls: vec![ToolCall::jupyter_cell("print('x')")],
        }])
        .unwrap();

        assert!(run.plan.validate().is_ok());
        assert!(run.plan.steps.last().unwrap().has_final_answer());
    }

    #[test]
    fn synthesize_final_step_reports_partial_completion() {
        let mut run = run();
        run.complete_current("first output".into());
        run.mark_failed();

        let final_step = run.synthesize_final_step("refinement attempts exhausted");

        assert!(final_step.has_final_answer());
        assert!(run.plan.validate().is_ok());
        assert_eq!(run.plan.total_steps, 2);
        match &final_step.tool_calls[0] {
            ToolCall::FinalAnswer { answer, .. } => {
                assert!(answer.contains("Completed 1 of"));
                assert!(answer.contains("refinement attempts exhausted"));
            }
            other => panic!("unexpected tool call {other:?}"),
        }
    }

    #[test]
    fn registry_rejects_second_run_for_same_session() {
        let registry = RunRegistry::new();
        registry.start("s1", run()).expect("first run starts");

        let err = registry.start("s1", run()).expect_err("second run rejected");
        assert!(matches!(err, AgentServerError::InvalidInput(_)));

        // A different session is unaffected.
        registry.start("s2", run()).expect("other session starts");
    }

    #[test]
    fn registry_allows_restart_after_completion() {
        let registry = RunRegistry::new();
        let mut first = run();
        first.status = RunStatus::Completed;
        registry.start("s1", first).unwrap();

        registry.start("s1", run()).expect("restart after completion");
    }
}
