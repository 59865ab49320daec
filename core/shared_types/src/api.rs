//! HTTP request/response contracts for the agent server.

use serde::{Deserialize, Serialize};

use crate::{
    CorrelationId, ErrorAnalysis, ExecutionError, ExecutionReport, Mismatch, NotebookContext,
    Plan, PlanChanges, Recommendation, ReplanDecision, SessionId, Step, ToolCall,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// `{error, status}` body used for every non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiErrorBody {
    pub error: String,
    pub status: u16,
}

// ---------------------------------------------------------------------------
// /agent/plan
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub request: String,
    #[serde(default)]
    pub notebook_context: NotebookContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlanResponse {
    pub plan: Plan,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// /agent/refine
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefineRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    pub error: ExecutionError,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_code: Option<String>,
    #[serde(default)]
    pub installed_packages: Vec<String>,
}

fn default_attempt() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefineResponse {
    pub tool_calls: Vec<ToolCall>,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// /agent/replan
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReplanRequest {
    pub original_request: String,
    #[serde(default)]
    pub executed_steps: Vec<Step>,
    pub failed_step: Step,
    pub error: ExecutionError,
    #[serde(default)]
    pub execution_output: String,
    #[serde(default)]
    pub installed_packages: Vec<String>,
    #[serde(default)]
    pub previous_attempts: u32,
}

/// Analysis block inside the replan response; keys stay snake_case because
/// the replan prompt pins that exact output schema.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplanAnalysis {
    pub root_cause: String,
    pub is_approach_problem: bool,
    pub missing_prerequisites: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReplanResponse {
    pub decision: ReplanDecision,
    pub analysis: ReplanAnalysis,
    pub reasoning: String,
    pub changes: PlanChanges,
    pub used_llm: bool,
    pub confidence: f64,
}

impl From<ErrorAnalysis> for ReplanResponse {
    fn from(analysis: ErrorAnalysis) -> Self {
        let missing = analysis
            .missing_package
            .clone()
            .map(|p| vec![p])
            .unwrap_or_default();
        ReplanResponse {
            decision: analysis.decision,
            analysis: ReplanAnalysis {
                root_cause: analysis.root_cause.clone(),
                is_approach_problem: analysis.is_approach_problem(),
                missing_prerequisites: missing,
            },
            reasoning: analysis.reasoning,
            changes: analysis.changes,
            used_llm: analysis.used_llm,
            confidence: analysis.confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// /agent/validate
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub code: String,
    #[serde(default)]
    pub notebook_context: NotebookContext,
}

/// Abridged validation output for clients that only need pass/fail.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ValidateResponse {
    pub valid: bool,
    pub errors: Vec<IssueBrief>,
    pub warnings: Vec<IssueBrief>,
    pub summary: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IssueBrief {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

// ---------------------------------------------------------------------------
// /agent/reflect
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReflectRequest {
    pub step: Step,
    pub execution_status: crate::ExecutionStatus,
    #[serde(default)]
    pub execution_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub remaining_steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// /agent/verify-state
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyStateRequest {
    pub step_number: u32,
    #[serde(default)]
    pub executed_code: String,
    pub execution_status: crate::ExecutionStatus,
    #[serde(default)]
    pub execution_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_variables: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyStateResponse {
    pub verified: bool,
    pub discrepancies: Vec<Mismatch>,
    pub confidence: f64,
    pub recommendation: Recommendation,
}

// ---------------------------------------------------------------------------
// /agent/report-execution
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReportExecutionRequest {
    pub session_id: SessionId,
    pub step_number: u32,
    pub report: ExecutionReport,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Escalated,
}

/// What the executor client should do next, carried on the acknowledgment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunDirective {
    DispatchStep { step: Step },
    RunComplete { final_answer: Option<String> },
    Escalated { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReportExecutionResponse {
    pub acknowledged: bool,
    pub run_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<RunDirective>,
}

// ---------------------------------------------------------------------------
// /chat
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<SessionId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: SessionId,
    pub model: String,
}

/// One SSE frame of a streaming chat reply.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamFrame {
    #[serde(default)]
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// /sessions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: f64,
    pub updated_at: f64,
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionStatus, ReplanDecision};
    use serde_json::json;

    #[test]
    fn plan_request_defaults_notebook_context() {
        let req: PlanRequest =
            serde_json::from_value(json!({"request": "analyze titanic.csv"})).expect("deserialize");
        assert_eq!(req.request, "analyze titanic.csv");
        assert_eq!(req.notebook_context.cell_count, 0);
        assert!(req.session_id.is_none());
    }

    #[test]
    fn replan_response_from_error_analysis() {
        let analysis = crate::ErrorAnalysis {
            decision: ReplanDecision::InsertSteps,
            root_cause: "module 'dask' is not installed".into(),
            reasoning: "install and retry".into(),
            missing_package: Some("dask".into()),
            changes: crate::PlanChanges::default(),
            used_llm: false,
            confidence: 1.0,
        };

        let response = ReplanResponse::from(analysis);
        assert_eq!(response.decision, ReplanDecision::InsertSteps);
        assert!(!response.analysis.is_approach_problem);
        assert_eq!(response.analysis.missing_prerequisites, vec!["dask"]);
    }

    #[test]
    fn verify_state_request_accepts_minimal_body() {
        let req: VerifyStateRequest = serde_json::from_value(json!({
            "stepNumber": 1,
            "executionStatus": "ok"
        }))
        .expect("deserialize");
        assert_eq!(req.execution_status, ExecutionStatus::Ok);
        assert!(req.expected_variables.is_none());
    }

    #[test]
    fn run_directive_serializes_with_action_tag() {
        let directive = RunDirective::RunComplete {
            final_answer: Some("done".into()),
        };
        let value = serde_json::to_value(&directive).expect("serialize");
        assert_eq!(value["action"], "run_complete");
    }
}
