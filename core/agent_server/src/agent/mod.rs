//! The agent orchestration core: planning, refinement, adaptive replanning,
//! state verification, and the per-session run state machine.

pub mod classifier;
pub mod condenser;
pub mod detector;
pub mod orchestrator;
pub mod prompts;
pub mod salvage;
pub mod validator;
pub mod verifier;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use shared_types::{
    ErrorAnalysis, ExecutionError, Plan, PlanChanges, PlanRequest, PlanResponse, RefineRequest,
    RefineResponse, ReplanDecision, ReplanRequest, ReplanResponse, ReportExecutionRequest,
    ReportExecutionResponse, RunDirective, RunStatus, Step, StepDraft, ToolCall, ValidateRequest,
    ValidateResponse, ValidationResult, VerifyStateRequest, VerifyStateResponse, IssueBrief,
    IssueCategory, IssueSeverity, Recommendation,
};

use crate::config_service::ConfigService;
use crate::error::{AgentServerError, ServerResult};
use crate::llm::{LlmError, LlmGateway};

use classifier::ErrorClassifier;
use detector::LibraryDetector;
use orchestrator::{RunRegistry, RunState};
use validator::CodeValidator;
use verifier::{StateVerifier, VerifyInput};

static PYTHON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```python\s*([\s\S]*?)\s*```").expect("python fence regex"));
static GENERIC_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```\s*([\s\S]*?)\s*```").expect("generic fence regex"));

pub struct AgentService {
    gateway: LlmGateway,
    config: Arc<ConfigService>,
    detector: LibraryDetector,
    verifier: StateVerifier,
    runs: RunRegistry,
}

impl AgentService {
    pub fn new(config: Arc<ConfigService>) -> Result<Self, LlmError> {
        let cfg = config.get();
        let gateway = LlmGateway::new(&cfg.gateway, &cfg.llm)?;
        let detector = LibraryDetector::new(&cfg.agent.knowledge_dir);

        Ok(Self {
            gateway,
            config,
            detector,
            verifier: StateVerifier::default(),
            runs: RunRegistry::new(),
        })
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    fn classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new(self.config.agent().pip_index_option)
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let llm = self.config.llm();
        self.gateway.generate(&llm, prompt, None).await
    }

    // -----------------------------------------------------------------
    // Sanitization
    // -----------------------------------------------------------------

    /// Remove a markdown code-fence wrapper from generated code, if any.
    pub fn strip_code_fences(code: &str) -> String {
        if let Some(caps) = PYTHON_FENCE.captures(code) {
            return caps[1].trim().to_string();
        }
        if let Some(caps) = GENERIC_FENCE.captures(code) {
            return caps[1].trim().to_string();
        }
        code.trim().to_string()
    }

    fn sanitize_tool_calls(tool_calls: &mut [ToolCall]) {
        for call in tool_calls {
            if let ToolCall::JupyterCell { code, .. } = call {
                *code = Self::strip_code_fences(code);
            }
        }
    }

    fn sanitize_plan(plan: &mut Plan) {
        for step in &mut plan.steps {
            Self::sanitize_tool_calls(&mut step.tool_calls);
        }
    }

    fn sanitize_drafts(drafts: &mut [StepDraft]) {
        for draft in drafts {
            Self::sanitize_tool_calls(&mut draft.tool_calls);
        }
    }

    fn sanitize_changes(changes: &mut PlanChanges) {
        Self::sanitize_drafts(&mut changes.new_steps);
        Self::sanitize_drafts(&mut changes.new_plan);
        if let Some(replacement) = changes.replacement.as_mut() {
            Self::sanitize_tool_calls(&mut replacement.tool_calls);
        }
    }

    // -----------------------------------------------------------------
    // Plan
    // -----------------------------------------------------------------

    /// Coerce a model-produced plan into the structural invariants:
    /// a single terminal final_answer and contiguous numbering.
    fn normalize_plan(plan: &mut Plan) {
        let last = plan.steps.len().saturating_sub(1);
        for step in plan.steps[..last].iter_mut() {
            step.tool_calls.retain(|tc| !tc.is_final_answer());
        }
        plan.steps.retain(|s| !s.tool_calls.is_empty());

        if !plan.steps.iter().any(Step::has_final_answer) {
            plan.steps.push(Step {
                step_number: 0,
                description: "Present the final result".to_string(),
                tool_calls: vec![ToolCall::final_answer("The requested steps completed.")],
                dependencies: Vec::new(),
                checkpoint: None,
                risk_level: None,
            });
        }

        plan.renumber();
    }

    fn parse_plan_payload(value: Value) -> ServerResult<(Plan, String)> {
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let plan_value = value
            .get("plan")
            .cloned()
            .ok_or_else(|| AgentServerError::Internal("model output has no plan object".into()))?;

        let mut plan: Plan = serde_json::from_value(plan_value)
            .map_err(|e| AgentServerError::Internal(format!("plan does not match schema: {e}")))?;

        if plan.steps.is_empty() {
            return Err(AgentServerError::Internal("plan has no steps".into()));
        }

        Self::sanitize_plan(&mut plan);
        Self::normalize_plan(&mut plan);
        plan.validate()
            .map_err(|e| AgentServerError::Internal(format!("plan invariant violated: {e}")))?;

        Ok((plan, reasoning))
    }

    pub async fn plan(&self, req: &PlanRequest) -> ServerResult<PlanResponse> {
        if req.request.trim().is_empty() {
            return Err(AgentServerError::InvalidInput("request is required".into()));
        }

        platform::record_counter("agent_plan_requests_total", 1);

        let knowledge = self
            .detector
            .format_knowledge_section(&req.request, &req.notebook_context.imported_libraries);
        let prompt = prompts::format_plan_prompt(
            &req.request,
            &req.notebook_context,
            &req.notebook_context.installed_packages,
            &knowledge,
        );

        let response = self.generate(&prompt).await?;
        let value = salvage::salvage_json(&response).ok_or_else(|| {
            AgentServerError::Internal("model output did not contain a plan object".into())
        })?;
        let (plan, reasoning) = Self::parse_plan_payload(value)?;

        if let Some(session_id) = &req.session_id {
            self.start_run(
                session_id,
                &req.request,
                req.notebook_context.clone(),
                plan.clone(),
            )?;
        }

        Ok(PlanResponse { plan, reasoning })
    }

    /// Register a validated plan as the session's active run. The executor
    /// is expected to dispatch step 1 and report through
    /// `report_execution` from then on.
    pub fn start_run(
        &self,
        session_id: &str,
        request: &str,
        notebook: shared_types::NotebookContext,
        plan: Plan,
    ) -> ServerResult<()> {
        plan.validate()
            .map_err(|e| AgentServerError::InvalidInput(format!("invalid plan: {e}")))?;

        let detected = self.detector.detect(request, &notebook.imported_libraries);

        // First-step preflight; failures surface through recovery once the
        // executor reports, so they only warn here.
        if let Some(code) = plan.steps[0].code() {
            let validator = CodeValidator::new(&notebook);
            let result = validator.full_validation(code, &detected);
            if result.has_errors {
                warn!(summary = %result.summary, "first step failed preflight validation");
            }
        }

        let total_steps = plan.total_steps;
        let run = RunState::new(request.to_string(), notebook, detected, plan);
        self.runs.start(session_id, run)?;
        info!(session = %session_id, steps = total_steps, "run started");
        Ok(())
    }

    /// Streaming variant: returns the assembled prompt so the HTTP layer can
    /// stream deltas and salvage the plan from the accumulated text.
    pub fn plan_prompt(&self, req: &PlanRequest) -> ServerResult<String> {
        if req.request.trim().is_empty() {
            return Err(AgentServerError::InvalidInput("request is required".into()));
        }
        let knowledge = self
            .detector
            .format_knowledge_section(&req.request, &req.notebook_context.imported_libraries);
        Ok(prompts::format_plan_prompt(
            &req.request,
            &req.notebook_context,
            &req.notebook_context.installed_packages,
            &knowledge,
        ))
    }

    /// Salvage a plan out of fully-accumulated streamed text.
    pub fn plan_from_stream_text(text: &str) -> ServerResult<(Plan, String)> {
        let value = salvage::salvage_json(text).ok_or_else(|| {
            AgentServerError::Internal("streamed output did not contain a plan object".into())
        })?;
        Self::parse_plan_payload(value)
    }

    // -----------------------------------------------------------------
    // Refine
    // -----------------------------------------------------------------

    fn parse_refine_response(response: &str) -> Option<(Vec<ToolCall>, String)> {
        if let Some(value) = salvage::salvage_json(response) {
            if let Some(calls_value) = value.get("toolCalls") {
                if let Ok(mut calls) =
                    serde_json::from_value::<Vec<ToolCall>>(calls_value.clone())
                {
                    if !calls.is_empty() {
                        Self::sanitize_tool_calls(&mut calls);
                        let reasoning = value
                            .get("reasoning")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        return Some((calls, reasoning));
                    }
                }
            }
        }

        // The model sometimes answers with bare code instead of JSON.
        let code = PYTHON_FENCE
            .captures(response)
            .or_else(|| GENERIC_FENCE.captures(response))
            .map(|caps| caps[1].trim().to_string())?;
        if code.is_empty() {
            return None;
        }
        Some((vec![ToolCall::jupyter_cell(code)], String::new()))
    }

    pub async fn refine(&self, req: &RefineRequest) -> ServerResult<RefineResponse> {
        let previous_code = req
            .previous_code
            .clone()
            .or_else(|| req.step.as_ref().and_then(|s| s.code().map(str::to_string)))
            .unwrap_or_default();

        platform::record_counter("agent_refine_requests_total", 1);

        let max_attempts = self.config.agent().max_refine_attempts;
        let prompt = prompts::format_refine_prompt(
            &previous_code,
            &req.error,
            req.attempt,
            max_attempts,
            &req.installed_packages,
        );

        let response = self.generate(&prompt).await?;
        let (tool_calls, reasoning) = Self::parse_refine_response(&response).ok_or_else(|| {
            AgentServerError::Internal("failed to generate refined code".into())
        })?;

        Ok(RefineResponse {
            tool_calls,
            reasoning,
        })
    }

    // -----------------------------------------------------------------
    // Replan
    // -----------------------------------------------------------------

    fn parse_replan_value(value: Value) -> ErrorAnalysis {
        let decision = value
            .get("decision")
            .and_then(Value::as_str)
            .and_then(classifier::parse_decision)
            .unwrap_or(ReplanDecision::Refine);

        let root_cause = value
            .get("analysis")
            .and_then(|a| a.get("root_cause"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut changes: PlanChanges = value
            .get("changes")
            .cloned()
            .and_then(|c| serde_json::from_value(c).ok())
            .unwrap_or_default();
        Self::sanitize_changes(&mut changes);

        ErrorAnalysis {
            decision,
            root_cause,
            reasoning,
            missing_package: None,
            changes,
            used_llm: true,
            confidence: value
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.7)
                .clamp(0.0, 1.0),
        }
    }

    /// The mandatory override: a module error whose package is genuinely
    /// missing is INSERT_STEPS no matter what the model preferred. The
    /// deterministic analysis already accounts for installed packages.
    fn enforce_module_override(
        error: &ExecutionError,
        llm_analysis: ErrorAnalysis,
        deterministic: &ErrorAnalysis,
    ) -> ErrorAnalysis {
        let kind = classifier::normalize_error_kind(&error.kind);
        if kind != "ModuleNotFoundError" && kind != "ImportError" {
            return llm_analysis;
        }
        if deterministic.decision != ReplanDecision::InsertSteps {
            return llm_analysis;
        }
        if llm_analysis.decision == ReplanDecision::InsertSteps {
            return llm_analysis;
        }

        warn!(
            llm_decision = ?llm_analysis.decision,
            "overriding LLM replan decision: module errors are always insert_steps"
        );
        platform::record_counter("agent_replan_overrides_total", 1);

        ErrorAnalysis {
            used_llm: true,
            ..deterministic.clone()
        }
    }

    pub async fn replan(&self, req: &ReplanRequest) -> ServerResult<ReplanResponse> {
        platform::record_counter("agent_replan_requests_total", 1);

        let classifier = self.classifier();
        let traceback = req.error.traceback_text();
        let deterministic = classifier.classify(
            &req.error.kind,
            &req.error.message,
            &traceback,
            &req.installed_packages,
        );

        // Deterministic answers need no model round-trip.
        if deterministic.decision == ReplanDecision::InsertSteps
            || deterministic.changes.system_dependency.is_some()
        {
            return Ok(ReplanResponse::from(deterministic));
        }

        let prompt = prompts::format_replan_prompt(
            &req.original_request,
            &req.executed_steps,
            &req.failed_step,
            &req.error,
            &req.execution_output,
            &req.installed_packages,
            &classifier.pip_install_command("<package>"),
        );

        match self.generate(&prompt).await {
            Ok(text) => match salvage::salvage_json(&text) {
                Some(value) => {
                    let llm_analysis = Self::parse_replan_value(value);
                    let final_analysis =
                        Self::enforce_module_override(&req.error, llm_analysis, &deterministic);
                    Ok(ReplanResponse::from(final_analysis))
                }
                None => {
                    warn!("replan output could not be salvaged, using deterministic decision");
                    Ok(ReplanResponse::from(deterministic))
                }
            },
            Err(e) => {
                warn!(error = %e, "replan LLM call failed, using deterministic decision");
                Ok(ReplanResponse::from(deterministic))
            }
        }
    }

    // -----------------------------------------------------------------
    // Reflection
    // -----------------------------------------------------------------

    /// Step-level self-evaluation against the step's checkpoint metadata.
    /// Returns the evaluation object the model produced.
    pub async fn reflect(
        &self,
        req: &shared_types::ReflectRequest,
    ) -> ServerResult<serde_json::Value> {
        platform::record_counter("agent_reflect_requests_total", 1);

        let status = match req.execution_status {
            shared_types::ExecutionStatus::Ok => "ok",
            shared_types::ExecutionStatus::Error => "error",
        };
        let prompt = prompts::format_reflection_prompt(
            &req.step,
            status,
            &req.execution_output,
            req.error_message.as_deref(),
            &req.remaining_steps,
        );

        let response = self.generate(&prompt).await?;
        salvage::salvage_json(&response).ok_or_else(|| {
            AgentServerError::Internal("reflection output was not parseable".into())
        })
    }

    // -----------------------------------------------------------------
    // Verification & validation
    // -----------------------------------------------------------------

    pub fn verify_state(&self, req: &VerifyStateRequest) -> VerifyStateResponse {
        let input = VerifyInput {
            step_number: req.step_number,
            executed_code: req.executed_code.clone(),
            execution_status: req.execution_status,
            execution_output: req.execution_output.clone(),
            error_message: req.error_message.clone(),
            expected_variables: req.expected_variables.clone().unwrap_or_default(),
            expected_output_patterns: req.expected_output_patterns.clone().unwrap_or_default(),
            previous_variables: req.previous_variables.clone().unwrap_or_default(),
            current_variables: req.current_variables.clone().unwrap_or_default(),
        };

        let verification = self.verifier.verify(&input);
        VerifyStateResponse {
            verified: verification.is_valid,
            confidence: verification.confidence,
            recommendation: verification.recommendation,
            discrepancies: verification.mismatches,
        }
    }

    pub fn validate(&self, req: &ValidateRequest) -> ValidateResponse {
        let detected = self
            .detector
            .detect(&req.code, &req.notebook_context.imported_libraries);
        let validator = CodeValidator::new(&req.notebook_context);
        let result = validator.full_validation(&req.code, &detected);
        Self::brief_validation(result)
    }

    fn brief_validation(result: ValidationResult) -> ValidateResponse {
        let brief = |severity: IssueSeverity| -> Vec<IssueBrief> {
            result
                .issues
                .iter()
                .filter(|i| i.severity == severity)
                .map(|i| IssueBrief {
                    message: i.message.clone(),
                    line: i.line,
                })
                .collect()
        };
        let errors = brief(IssueSeverity::Error);
        let warnings = brief(IssueSeverity::Warning);

        ValidateResponse {
            valid: result.is_valid,
            errors,
            warnings,
            summary: result.summary,
        }
    }

    // -----------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------

    /// Render recent history as context, condensing it to the provider's
    /// budget first when it overruns.
    pub async fn chat_context(&self, messages: &[shared_types::ChatMessage]) -> Option<String> {
        if messages.is_empty() {
            return None;
        }

        let llm = self.config.llm();
        let condenser = condenser::ContextCondenser::new(llm.default_provider.clone());
        let summarizer = GatewaySummarizer {
            gateway: &self.gateway,
            llm: llm.clone(),
        };

        let (condensed, stats) = condenser
            .condense(
                messages,
                condenser.token_limit(),
                condenser::CompressionStrategy::Adaptive,
                Some(&summarizer),
            )
            .await;
        if stats.strategy_used != "none" {
            info!(
                strategy = stats.strategy_used,
                removed = stats.messages_removed,
                "conversation context condensed"
            );
        }

        Some(
            condensed
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    pub async fn chat(
        &self,
        message: &str,
        context: Option<&str>,
    ) -> ServerResult<(String, String)> {
        let llm = self.config.llm();
        let model = self.gateway.model_name(&llm);
        let response = self.gateway.generate(&llm, message, context).await?;
        Ok((response, model))
    }

    pub async fn chat_stream(
        &self,
        message: &str,
        context: Option<&str>,
    ) -> ServerResult<crate::llm::TextStream> {
        let llm = self.config.llm();
        Ok(self.gateway.stream(&llm, message, context).await?)
    }

    // -----------------------------------------------------------------
    // Run loop (report-execution)
    // -----------------------------------------------------------------

    fn dispatch(step: Step) -> ReportExecutionResponse {
        ReportExecutionResponse {
            acknowledged: true,
            run_status: RunStatus::Running,
            directive: Some(RunDirective::DispatchStep { step }),
        }
    }

    fn escalate(run: &mut RunState, reason: impl Into<String>) -> ReportExecutionResponse {
        let reason = reason.into();
        run.status = RunStatus::Escalated;
        platform::record_counter("agent_runs_escalated_total", 1);
        ReportExecutionResponse {
            acknowledged: true,
            run_status: RunStatus::Escalated,
            directive: Some(RunDirective::Escalated { reason }),
        }
    }

    fn synthetic_error(result: &ValidationResult) -> ExecutionError {
        let kind = if result
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::Syntax)
        {
            "SyntaxError"
        } else {
            "NameError"
        };
        let detail = result
            .issues
            .iter()
            .find(|i| i.severity == IssueSeverity::Error)
            .map(|i| i.message.clone())
            .unwrap_or_else(|| result.summary.clone());
        ExecutionError {
            kind: kind.to_string(),
            message: format!("pre-execution validation failed: {detail}"),
            traceback: Vec::new(),
        }
    }

    pub async fn report_execution(
        &self,
        req: &ReportExecutionRequest,
    ) -> ServerResult<ReportExecutionResponse> {
        let run_arc = self.runs.get(&req.session_id).ok_or_else(|| {
            AgentServerError::NotFound(format!("no active run for session '{}'", req.session_id))
        })?;
        let mut run = run_arc.lock().await;

        match run.status {
            RunStatus::Completed => {
                return Ok(ReportExecutionResponse {
                    acknowledged: true,
                    run_status: RunStatus::Completed,
                    directive: Some(RunDirective::RunComplete {
                        final_answer: run.final_answer(),
                    }),
                });
            }
            RunStatus::Escalated => {
                return Ok(ReportExecutionResponse {
                    acknowledged: true,
                    run_status: RunStatus::Escalated,
                    directive: Some(RunDirective::Escalated {
                        reason: "run was previously escalated".into(),
                    }),
                });
            }
            RunStatus::Running => {}
        }

        let current = run
            .current_step()
            .cloned()
            .ok_or_else(|| AgentServerError::Internal("run has no current step".into()))?;
        if current.step_number != req.step_number {
            return Err(AgentServerError::InvalidInput(format!(
                "expected a report for step {}, received step {}",
                current.step_number, req.step_number
            )));
        }

        if let Some(installed) = &req.report.installed_packages {
            for package in installed {
                if !run.installed_packages.contains(package) {
                    run.installed_packages.push(package.clone());
                }
            }
        }

        let checkpoint = current.checkpoint.clone().unwrap_or_default();
        let verification = self.verifier.verify(&VerifyInput {
            step_number: current.step_number,
            executed_code: current.code().unwrap_or("").to_string(),
            execution_status: req.report.status,
            execution_output: req.report.output(),
            error_message: req
                .report
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.message)),
            expected_variables: checkpoint.expected_variables,
            expected_output_patterns: checkpoint.expected_output_patterns,
            previous_variables: Vec::new(),
            current_variables: req.report.new_variables.clone().unwrap_or_default(),
        });

        match verification.recommendation {
            Recommendation::Proceed => self.advance(&mut run, req.report.output()).await,
            Recommendation::Warning => {
                warn!(
                    step = current.step_number,
                    confidence = verification.confidence,
                    "verification warning, proceeding"
                );
                self.advance(&mut run, req.report.output()).await
            }
            _ => {
                let error = req.report.error.clone().unwrap_or_else(|| ExecutionError {
                    kind: "RuntimeError".to_string(),
                    message: if req.report.stderr.is_empty() {
                        "step verification failed".to_string()
                    } else {
                        req.report.stderr.clone()
                    },
                    traceback: Vec::new(),
                });
                let output = req.report.output();
                self.recover(&mut run, &error, &output).await
            }
        }
    }

    /// Mark the current step done and hand the executor its next step,
    /// preflighting the code before dispatch.
    async fn advance(
        &self,
        run: &mut RunState,
        output: String,
    ) -> ServerResult<ReportExecutionResponse> {
        let Some(next) = run.complete_current(output) else {
            platform::record_counter("agent_runs_completed_total", 1);
            return Ok(ReportExecutionResponse {
                acknowledged: true,
                run_status: RunStatus::Completed,
                directive: Some(RunDirective::RunComplete {
                    final_answer: run.final_answer(),
                }),
            });
        };

        if !run.dependencies_satisfied(&next) {
            warn!(step = next.step_number, "dispatching step with unmet dependency marker");
        }

        if let Some(code) = next.code() {
            let validator = CodeValidator::new(&run.notebook);
            let result = validator.full_validation(code, &run.detected_libraries);
            if result.has_errors {
                let error = Self::synthetic_error(&result);
                info!(
                    step = next.step_number,
                    kind = %error.kind,
                    "pre-execution validation failed, entering recovery"
                );
                return self.recover(run, &error, "").await;
            }
        }

        Ok(Self::dispatch(next))
    }

    /// The RECOVERY branch of the run loop.
    async fn recover(
        &self,
        run: &mut RunState,
        error: &ExecutionError,
        execution_output: &str,
    ) -> ServerResult<ReportExecutionResponse> {
        run.mark_failed();

        let classifier = self.classifier();
        let traceback = error.traceback_text();
        let installed = run.installed_packages.clone();
        let llm_cfg = self.config.llm();

        let analysis = classifier
            .classify_with_fallback(
                &error.kind,
                &error.message,
                &traceback,
                &installed,
                run.refine_attempts,
                Some((&self.gateway, &llm_cfg)),
            )
            .await;
        let deterministic =
            classifier.classify(&error.kind, &error.message, &traceback, &installed);
        let analysis = Self::enforce_module_override(error, analysis, &deterministic);

        info!(
            decision = ?analysis.decision,
            root_cause = %analysis.root_cause,
            used_llm = analysis.used_llm,
            "recovery decision"
        );
        platform::record_counter("agent_recoveries_total", 1);
        run.mark_recovering();

        match analysis.decision {
            ReplanDecision::InsertSteps => {
                let mut drafts = analysis.changes.new_steps.clone();
                Self::sanitize_drafts(&mut drafts);
                match run.insert_steps(drafts) {
                    Some(step) => Ok(Self::dispatch(step)),
                    None => Ok(Self::escalate(run, "no prerequisite steps were produced")),
                }
            }
            ReplanDecision::Refine => self.recover_refine(run, error, &installed).await,
            ReplanDecision::ReplaceStep | ReplanDecision::ReplanRemaining => {
                self.recover_replan(run, error, execution_output, analysis.decision, &classifier)
                    .await
            }
        }
    }

    async fn recover_refine(
        &self,
        run: &mut RunState,
        error: &ExecutionError,
        installed: &[String],
    ) -> ServerResult<ReportExecutionResponse> {
        let max_attempts = self.config.agent().max_refine_attempts;
        if run.refine_attempts >= max_attempts {
            let step = run.synthesize_final_step("refinement attempts exhausted");
            return Ok(Self::dispatch(step));
        }
        run.refine_attempts += 1;

        let previous_code = run
            .current_step()
            .and_then(|s| s.code())
            .unwrap_or("")
            .to_string();
        let prompt = prompts::format_refine_prompt(
            &previous_code,
            error,
            run.refine_attempts,
            max_attempts,
            installed,
        );

        match self.generate(&prompt).await {
            Ok(text) => match Self::parse_refine_response(&text) {
                Some((calls, _)) => match run.replace_current_tool_calls(calls) {
                    Some(step) => Ok(Self::dispatch(step)),
                    None => Ok(Self::escalate(run, "no current step to refine")),
                },
                None => Ok(Self::escalate(run, "refinement produced no usable code")),
            },
            Err(e) => Ok(Self::escalate(
                run,
                format!("LLM unavailable during refinement: {e}"),
            )),
        }
    }

    async fn recover_replan(
        &self,
        run: &mut RunState,
        error: &ExecutionError,
        execution_output: &str,
        decision: ReplanDecision,
        classifier: &ErrorClassifier,
    ) -> ServerResult<ReportExecutionResponse> {
        let max_replans = self.config.agent().max_replan_events;
        if run.replan_events >= max_replans {
            let step = run.synthesize_final_step("replanning limit reached");
            return Ok(Self::dispatch(step));
        }

        let executed: Vec<Step> = run
            .plan
            .steps
            .iter()
            .zip(run.step_states.iter())
            .filter(|(_, state)| **state == shared_types::StepState::Completed)
            .map(|(step, _)| step.clone())
            .collect();
        let failed = run
            .current_step()
            .cloned()
            .ok_or_else(|| AgentServerError::Internal("run has no current step".into()))?;

        let prompt = prompts::format_replan_prompt(
            &run.original_request,
            &executed,
            &failed,
            error,
            execution_output,
            &run.installed_packages,
            &classifier.pip_install_command("<package>"),
        );

        let text = match self.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                return Ok(Self::escalate(
                    run,
                    format!("LLM unavailable during replanning: {e}"),
                ))
            }
        };
        let Some(value) = salvage::salvage_json(&text) else {
            return Ok(Self::escalate(run, "replanner output was not parseable"));
        };
        let llm_analysis = Self::parse_replan_value(value);

        match decision {
            ReplanDecision::ReplaceStep => {
                let Some(replacement) = llm_analysis.changes.replacement else {
                    return Ok(Self::escalate(run, "replanner produced no replacement step"));
                };
                run.replan_events += 1;
                match run.replace_current_step(replacement) {
                    Some(step) => Ok(Self::dispatch(step)),
                    None => Ok(Self::escalate(run, "no current step to replace")),
                }
            }
            _ => {
                let drafts = llm_analysis.changes.new_plan;
                match run.replan_remaining(drafts) {
                    Some(step) => Ok(Self::dispatch(step)),
                    None => Ok(Self::escalate(run, "replanner produced no remaining plan")),
                }
            }
        }
    }
}

/// Condenser summarizer backed by the gateway.
struct GatewaySummarizer<'a> {
    gateway: &'a LlmGateway,
    llm: crate::config_service::LlmConfig,
}

impl condenser::Summarizer for GatewaySummarizer<'_> {
    fn summarize<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, LlmError>> + Send + 'a>>
    {
        Box::pin(async move {
            let prompt = prompts::format_summary_prompt(text);
            self.gateway.generate(&self.llm, &prompt, None).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_types::NotebookContext;

    #[test]
    fn strip_code_fences_removes_wrappers() {
        assert_eq!(
            AgentService::strip_code_fences("```python\nprint('hi')\n```"),
            "print('hi')"
        );
        assert_eq!(
            AgentService::strip_code_fences("```\nx = 1\n```"),
            "x = 1"
        );
        assert_eq!(AgentService::strip_code_fences("plain code"), "plain code");
    }

    #[test]
    fn parse_plan_payload_accepts_planner_output() {
        let value = json!({
            "reasoning": "two step plan",
            "plan": {
                "totalSteps": 2,
                "steps": [
                    {
                        "stepNumber": 1,
                        "description": "load",
                        "toolCalls": [
                            {"tool": "jupyter_cell",
                             "parameters": {"code": "```python\nimport pandas as pd\n```"}}
                        ],
                        "dependencies": []
                    },
                    {
                        "stepNumber": 2,
                        "description": "done",
                        "toolCalls": [
                            {"tool": "final_answer", "parameters": {"answer": "finished"}}
                        ],
                        "dependencies": [1]
                    }
                ]
            }
        });

        let (plan, reasoning) = AgentService::parse_plan_payload(value).expect("plan parses");
        assert_eq!(reasoning, "two step plan");
        assert_eq!(plan.total_steps, 2);
        // Fences are stripped during sanitization.
        assert_eq!(plan.steps[0].code().unwrap(), "import pandas as pd");
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn parse_plan_payload_repairs_missing_final_answer() {
        let value = json!({
            "plan": {
                "totalSteps": 1,
                "steps": [
                    {
                        "stepNumber": 1,
                        "description": "only code",
                        "toolCalls": [
                            {"tool": "jupyter_cell", "parameters": {"code": "print(1)"}}
                        ],
                        "dependencies": []
                    }
                ]
            }
        });

        let (plan, _) = AgentService::parse_plan_payload(value).expect("plan parses");
        assert!(plan.validate().is_ok());
        assert!(plan.steps.last().unwrap().has_final_answer());
    }

    #[test]
    fn parse_plan_payload_rejects_planless_output() {
        let err = AgentService::parse_plan_payload(json!({"reasoning": "no plan"}))
            .expect_err("missing plan rejected");
        assert!(matches!(err, AgentServerError::Internal(_)));
    }

    #[test]
    fn parse_refine_response_prefers_json_tool_calls() {
        let response = r#"```json
{"reasoning": "added encoding", "toolCalls": [
  {"tool": "jupyter_cell",
   "parameters": {"code": "df = pd.read_csv('data.csv', encoding='cp949')"}}
]}
```"#;
        let (calls, reasoning) =
            AgentService::parse_refine_response(response).expect("parses");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].code().unwrap().contains("encoding="));
        assert_eq!(reasoning, "added encoding");
    }

    #[test]
    fn parse_refine_response_falls_back_to_bare_code() {
        let response = "Here is the fix:\n```python\ndf = pd.read_csv('d.csv', encoding='utf-8')\n```";
        let (calls, _) = AgentService::parse_refine_response(response).expect("parses");
        assert!(calls[0].code().unwrap().starts_with("df ="));
    }

    #[test]
    fn parse_refine_response_rejects_prose() {
        assert!(AgentService::parse_refine_response("cannot help with that").is_none());
    }

    #[test]
    fn module_override_rewrites_llm_disagreement() {
        let error = ExecutionError {
            kind: "ModuleNotFoundError".into(),
            message: "No module named 'pyarrow'".into(),
            traceback: vec![],
        };
        let classifier = ErrorClassifier::new("");
        let deterministic = classifier.classify(&error.kind, &error.message, "", &[]);
        assert_eq!(deterministic.decision, ReplanDecision::InsertSteps);

        let llm_says_refine = ErrorAnalysis {
            decision: ReplanDecision::Refine,
            root_cause: "model thinks code is wrong".into(),
            reasoning: "".into(),
            missing_package: None,
            changes: PlanChanges::default(),
            used_llm: true,
            confidence: 0.9,
        };

        let overridden =
            AgentService::enforce_module_override(&error, llm_says_refine, &deterministic);
        assert_eq!(overridden.decision, ReplanDecision::InsertSteps);
        assert!(overridden.used_llm);
        assert_eq!(overridden.missing_package.as_deref(), Some("pyarrow"));
    }

    #[test]
    fn module_override_keeps_llm_answer_when_package_installed() {
        let error = ExecutionError {
            kind: "ModuleNotFoundError".into(),
            message: "No module named 'pyarrow'".into(),
            traceback: vec![],
        };
        let classifier = ErrorClassifier::new("");
        let installed = vec!["pyarrow".to_string()];
        let deterministic = classifier.classify(&error.kind, &error.message, "", &installed);
        // Installed package means the classifier itself says refine.
        assert_eq!(deterministic.decision, ReplanDecision::Refine);

        let llm = ErrorAnalysis {
            decision: ReplanDecision::ReplaceStep,
            root_cause: "".into(),
            reasoning: "".into(),
            missing_package: None,
            changes: PlanChanges::default(),
            used_llm: true,
            confidence: 0.8,
        };
        let result = AgentService::enforce_module_override(&error, llm, &deterministic);
        assert_eq!(result.decision, ReplanDecision::ReplaceStep);
    }

    #[test]
    fn synthetic_error_kind_follows_issue_category() {
        let validator = CodeValidator::new(&NotebookContext::default());

        let syntax = validator.full_validation("x = (1", &[]);
        let err = AgentService::synthetic_error(&syntax);
        assert_eq!(err.kind, "SyntaxError");

        let undefined = validator.full_validation("print(mystery_name_xyz)", &[]);
        let err = AgentService::synthetic_error(&undefined);
        assert_eq!(err.kind, "NameError");
    }
}
