use serde::{Deserialize, Serialize};
use std::fmt;

// API request/response contracts live in a separate module to keep the
// domain types readable.
pub mod api;
pub use api::*;

/// Correlation identifier joining logs across a single request.
pub type CorrelationId = uuid::Uuid;

/// Opaque conversation/session identifier supplied by clients.
pub type SessionId = String;

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// One action the external executor is asked to perform.
///
/// The wire shape is `{"tool": "...", "parameters": {...}}`, matching what
/// the planner prompt instructs the model to emit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "tool", content = "parameters", rename_all = "snake_case")]
pub enum ToolCall {
    JupyterCell {
        code: String,
        #[serde(
            rename = "cellIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        cell_index: Option<u32>,
    },
    Markdown {
        content: String,
        #[serde(
            rename = "cellIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        cell_index: Option<u32>,
    },
    FinalAnswer {
        answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ReadFile {
        path: String,
    },
    ListFiles {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    ExecuteCommand {
        command: String,
    },
    SearchWorkspace {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    SearchNotebookCells {
        pattern: String,
    },
    CheckResource {
        resource: String,
    },
}

impl ToolCall {
    pub fn jupyter_cell(code: impl Into<String>) -> Self {
        ToolCall::JupyterCell {
            code: code.into(),
            cell_index: None,
        }
    }

    pub fn final_answer(answer: impl Into<String>) -> Self {
        ToolCall::FinalAnswer {
            answer: answer.into(),
            summary: None,
        }
    }

    pub fn is_final_answer(&self) -> bool {
        matches!(self, ToolCall::FinalAnswer { .. })
    }

    /// The Python code carried by a `jupyter_cell` call, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            ToolCall::JupyterCell { code, .. } => Some(code),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Plans and steps
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Per-step verification metadata emitted by the structured planner.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expected_variables: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expected_output_patterns: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_number: u32,
    pub description: String,
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

impl Step {
    /// First `jupyter_cell` code of the step, if it has one.
    pub fn code(&self) -> Option<&str> {
        self.tool_calls.iter().find_map(|tc| tc.code())
    }

    pub fn has_final_answer(&self) -> bool {
        self.tool_calls.iter().any(|tc| tc.is_final_answer())
    }
}

/// A step as produced by recovery responses, before it is numbered into the
/// plan. `stepNumber`/`dependencies` are assigned when the plan is spliced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDraft {
    pub description: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub total_steps: u32,
    pub steps: Vec<Step>,
}

/// Violations of the structural plan invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    StepCountMismatch { declared: u32, actual: usize },
    NonContiguousNumbering { position: usize, found: u32 },
    ForwardDependency { step: u32, dependency: u32 },
    FinalAnswerCount { found: usize },
    FinalAnswerNotLast { step: u32 },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::StepCountMismatch { declared, actual } => {
                write!(f, "totalSteps={declared} but plan has {actual} steps")
            }
            PlanError::NonContiguousNumbering { position, found } => {
                write!(f, "step at position {position} is numbered {found}")
            }
            PlanError::ForwardDependency { step, dependency } => {
                write!(f, "step {step} depends on later step {dependency}")
            }
            PlanError::FinalAnswerCount { found } => {
                write!(f, "plan must contain exactly one final_answer, found {found}")
            }
            PlanError::FinalAnswerNotLast { step } => {
                write!(f, "final_answer appears on step {step}, not the last step")
            }
        }
    }
}

impl std::error::Error for PlanError {}

impl Plan {
    /// Check the structural invariants: contiguous 1..N numbering, no
    /// forward dependencies, and exactly one terminal `final_answer`.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.total_steps as usize != self.steps.len() {
            return Err(PlanError::StepCountMismatch {
                declared: self.total_steps,
                actual: self.steps.len(),
            });
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.step_number != (i as u32) + 1 {
                return Err(PlanError::NonContiguousNumbering {
                    position: i,
                    found: step.step_number,
                });
            }
            for &dep in &step.dependencies {
                if dep >= step.step_number {
                    return Err(PlanError::ForwardDependency {
                        step: step.step_number,
                        dependency: dep,
                    });
                }
            }
        }

        let final_steps: Vec<&Step> = self.steps.iter().filter(|s| s.has_final_answer()).collect();
        if final_steps.len() != 1 {
            return Err(PlanError::FinalAnswerCount {
                found: final_steps.len(),
            });
        }
        let final_step = final_steps[0];
        if final_step.step_number != self.total_steps {
            return Err(PlanError::FinalAnswerNotLast {
                step: final_step.step_number,
            });
        }

        Ok(())
    }

    /// Renumber steps 1..N and refresh `totalSteps` after a splice.
    pub fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            let number = (i as u32) + 1;
            step.step_number = number;
            step.dependencies.retain(|&d| d < number);
        }
        self.total_steps = self.steps.len() as u32;
    }
}

/// Lifecycle of a step inside a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Validating,
    Dispatched,
    Verifying,
    Completed,
    Failed,
    Recovering,
}

// ---------------------------------------------------------------------------
// Execution reports
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Error kind as reported by the kernel, e.g. `ModuleNotFoundError`.
    #[serde(alias = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ExecutionError {
    pub fn traceback_text(&self) -> String {
        self.traceback.join("\n")
    }
}

/// What the external executor observed for one dispatched step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_packages: Option<Vec<String>>,
}

impl ExecutionReport {
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }

    pub fn output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplanDecision {
    /// Keep the approach, fix the code.
    Refine,
    /// Splice preparatory steps (typically installs) before the failed one.
    InsertSteps,
    /// Swap the failed step for a different approach.
    ReplaceStep,
    /// Rewrite the plan suffix starting at the failed step.
    ReplanRemaining,
}

/// Decision-specific payload accompanying an `ErrorAnalysis`.
///
/// Keys are snake_case on the wire because that is the shape the replan
/// prompt mandates in its output schema.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PlanChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_code: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_steps: Vec<StepDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<StepDraft>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_plan: Vec<StepDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_dependency: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAnalysis {
    pub decision: ReplanDecision,
    pub root_cause: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_package: Option<String>,
    #[serde(default)]
    pub changes: PlanChanges,
    #[serde(default)]
    pub used_llm: bool,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl ErrorAnalysis {
    pub fn is_approach_problem(&self) -> bool {
        matches!(
            self.decision,
            ReplanDecision::ReplaceStep | ReplanDecision::ReplanRemaining
        )
    }
}

// ---------------------------------------------------------------------------
// State verification
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MismatchType {
    VariableMissing,
    OutputMismatch,
    ExceptionOccurred,
    ImportFailed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    Warning,
    Replan,
    Escalate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    #[serde(rename = "type")]
    pub mismatch_type: MismatchType,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Weighted factors contributing to the verification confidence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceFactors {
    pub output_match: f64,
    pub variable_creation: f64,
    pub no_exceptions: f64,
    pub execution_complete: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    pub output_match: f64,
    pub variable_creation: f64,
    pub no_exceptions: f64,
    pub execution_complete: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            output_match: 0.30,
            variable_creation: 0.30,
            no_exceptions: 0.25,
            execution_complete: 0.15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceDetails {
    pub factors: ConfidenceFactors,
    pub weights: ConfidenceWeights,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateVerification {
    pub is_valid: bool,
    pub confidence: f64,
    pub confidence_details: ConfidenceDetails,
    pub mismatches: Vec<Mismatch>,
    pub recommendation: Recommendation,
    pub step_number: u32,
    pub timestamp: String,
}

impl StateVerification {
    pub fn has_critical(&self) -> bool {
        self.mismatches
            .iter()
            .any(|m| m.severity == Severity::Critical)
    }
}

// ---------------------------------------------------------------------------
// Code validation
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Syntax,
    UndefinedName,
    UnusedImport,
    UnusedVariable,
    Redefined,
    ImportError,
    TypeError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

/// What a code snippet imports, defines and uses.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DependencyInfo {
    pub imports: Vec<String>,
    pub from_imports: std::collections::BTreeMap<String, Vec<String>>,
    pub defined_names: Vec<String>,
    pub used_names: Vec<String>,
    pub undefined_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencyInfo>,
    pub has_errors: bool,
    pub has_warnings: bool,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Notebook context
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Code,
    Markdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecentCell {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(rename = "type")]
    pub kind: CellKind,
    pub source: String,
}

/// Read-only snapshot of the notebook, supplied with each planning request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NotebookContext {
    pub cell_count: u32,
    pub imported_libraries: Vec<String>,
    pub defined_variables: Vec<String>,
    pub recent_cells: Vec<RecentCell>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub installed_packages: Vec<String>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "User"),
            Role::Assistant => write!(f, "Assistant"),
            Role::System => write!(f, "System"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Seconds since the Unix epoch, fractional.
    pub timestamp: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
