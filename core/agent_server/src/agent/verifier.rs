//! Post-execution verification: diff the observed kernel state against the
//! step's expectations, score confidence, and recommend the next move.

use std::collections::VecDeque;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use shared_types::{
    ConfidenceDetails, ConfidenceFactors, ConfidenceWeights, ExecutionStatus, Mismatch,
    MismatchType, Recommendation, Severity, StateVerification,
};

const HISTORY_CAPACITY: usize = 50;

pub const PROCEED_THRESHOLD: f64 = 0.80;
pub const WARNING_THRESHOLD: f64 = 0.60;
pub const REPLAN_THRESHOLD: f64 = 0.40;

static MODULE_IN_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"No module named ['"]([^'"]+)['"]"#).expect("module regex"));

/// Everything the verifier needs about one executed step.
#[derive(Debug, Clone)]
pub struct VerifyInput {
    pub step_number: u32,
    pub executed_code: String,
    pub execution_status: ExecutionStatus,
    pub execution_output: String,
    pub error_message: Option<String>,
    pub expected_variables: Vec<String>,
    pub expected_output_patterns: Vec<String>,
    pub previous_variables: Vec<String>,
    pub current_variables: Vec<String>,
}

impl Default for VerifyInput {
    fn default() -> Self {
        Self {
            step_number: 0,
            executed_code: String::new(),
            execution_status: ExecutionStatus::Ok,
            execution_output: String::new(),
            error_message: None,
            expected_variables: Vec::new(),
            expected_output_patterns: Vec::new(),
            previous_variables: Vec::new(),
            current_variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendReport {
    pub average: f64,
    /// Second-half mean minus first-half mean; positive means improving.
    pub trend: f64,
    pub critical_count: usize,
    pub samples: usize,
}

pub struct StateVerifier {
    weights: ConfidenceWeights,
    history: Mutex<VecDeque<StateVerification>>,
}

impl Default for StateVerifier {
    fn default() -> Self {
        Self::new(ConfidenceWeights::default())
    }
}

impl StateVerifier {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self {
            weights,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn verify(&self, input: &VerifyInput) -> StateVerification {
        let mut mismatches = Vec::new();

        for variable in &input.expected_variables {
            if !input.current_variables.contains(variable) {
                mismatches.push(Mismatch {
                    mismatch_type: MismatchType::VariableMissing,
                    severity: Severity::Major,
                    description: format!("expected variable '{variable}' was not created"),
                    suggestion: Some(format!(
                        "check that the step assigns '{variable}' before it is needed"
                    )),
                });
            }
        }

        let mut patterns_matched = 0usize;
        for pattern in &input.expected_output_patterns {
            let matched = match Regex::new(pattern) {
                Ok(re) => re.is_match(&input.execution_output),
                // An unparsable pattern degrades to a substring check.
                Err(_) => input.execution_output.contains(pattern.as_str()),
            };
            if matched {
                patterns_matched += 1;
            } else {
                mismatches.push(Mismatch {
                    mismatch_type: MismatchType::OutputMismatch,
                    severity: Severity::Minor,
                    description: format!("output did not match expected pattern '{pattern}'"),
                    suggestion: None,
                });
            }
        }

        if input.execution_status == ExecutionStatus::Error {
            let message = input.error_message.as_deref().unwrap_or("unknown error");
            let kind = message.split(':').next().unwrap_or("").trim();
            mismatches.push(Mismatch {
                mismatch_type: MismatchType::ExceptionOccurred,
                severity: Severity::Critical,
                description: format!("execution raised: {message}"),
                suggestion: Some(suggestion_for(kind)),
            });

            if kind == "ModuleNotFoundError" || kind == "ImportError" {
                let module = MODULE_IN_ERROR
                    .captures(message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                mismatches.push(Mismatch {
                    mismatch_type: MismatchType::ImportFailed,
                    severity: Severity::Major,
                    description: format!("import of '{module}' failed"),
                    suggestion: Some(format!("install '{module}' before this step runs")),
                });
            }
        }

        let ok = input.execution_status == ExecutionStatus::Ok;
        let factors = ConfidenceFactors {
            output_match: fraction(
                patterns_matched,
                input.expected_output_patterns.len(),
            ),
            variable_creation: fraction(
                input
                    .expected_variables
                    .iter()
                    .filter(|v| input.current_variables.contains(*v))
                    .count(),
                input.expected_variables.len(),
            ),
            no_exceptions: if ok { 1.0 } else { 0.0 },
            execution_complete: if ok { 1.0 } else { 0.0 },
        };

        let confidence = factors.output_match * self.weights.output_match
            + factors.variable_creation * self.weights.variable_creation
            + factors.no_exceptions * self.weights.no_exceptions
            + factors.execution_complete * self.weights.execution_complete;

        let has_critical = mismatches.iter().any(|m| m.severity == Severity::Critical);
        let recommendation = if has_critical || confidence < REPLAN_THRESHOLD {
            Recommendation::Escalate
        } else if confidence >= PROCEED_THRESHOLD {
            Recommendation::Proceed
        } else if confidence >= WARNING_THRESHOLD {
            Recommendation::Warning
        } else {
            Recommendation::Replan
        };

        let result = StateVerification {
            is_valid: !has_critical,
            confidence,
            confidence_details: ConfidenceDetails {
                factors,
                weights: self.weights,
            },
            mismatches,
            recommendation,
            step_number: input.step_number,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut history = self.history.lock().expect("verifier history lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(result.clone());

        result
    }

    pub fn history(&self) -> Vec<StateVerification> {
        self.history
            .lock()
            .expect("verifier history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .expect("verifier history lock poisoned")
            .clear();
    }

    /// Mean confidence, first-half/second-half slope, and critical count
    /// over the retained window.
    pub fn analyze_trend(&self) -> TrendReport {
        let history = self.history.lock().expect("verifier history lock poisoned");
        let samples = history.len();
        if samples == 0 {
            return TrendReport {
                average: 0.0,
                trend: 0.0,
                critical_count: 0,
                samples: 0,
            };
        }

        let scores: Vec<f64> = history.iter().map(|v| v.confidence).collect();
        let average = scores.iter().sum::<f64>() / samples as f64;

        let trend = if samples >= 2 {
            let mid = samples / 2;
            let first = scores[..mid].iter().sum::<f64>() / mid.max(1) as f64;
            let second = scores[mid..].iter().sum::<f64>() / (samples - mid) as f64;
            second - first
        } else {
            0.0
        };

        let critical_count = history
            .iter()
            .filter(|v| {
                v.mismatches
                    .iter()
                    .any(|m| m.severity == Severity::Critical)
            })
            .count();

        TrendReport {
            average,
            trend,
            critical_count,
            samples,
        }
    }
}

fn fraction(matched: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        matched as f64 / total as f64
    }
}

fn suggestion_for(error_kind: &str) -> String {
    match error_kind {
        "ModuleNotFoundError" | "ImportError" => {
            "run pip install for the missing package".to_string()
        }
        "NameError" => "check that the variable is defined before use".to_string(),
        "FileNotFoundError" => "check the file path and that the file exists".to_string(),
        "TypeError" => "check the argument and value types".to_string(),
        "KeyError" => "check that the key or column exists".to_string(),
        "IndexError" => "check the index against the container length".to_string(),
        _ => "inspect the traceback for the root cause".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> StateVerifier {
        StateVerifier::default()
    }

    fn ok_input() -> VerifyInput {
        VerifyInput {
            step_number: 1,
            executed_code: "x = 1".into(),
            execution_status: ExecutionStatus::Ok,
            ..VerifyInput::default()
        }
    }

    #[test]
    fn expected_variable_created_proceeds() {
        let result = verifier().verify(&VerifyInput {
            executed_code: "df = pd.read_csv('test.csv')".into(),
            expected_variables: vec!["df".into()],
            current_variables: vec!["df".into()],
            ..ok_input()
        });

        assert!(result.is_valid);
        assert!(result.confidence >= PROCEED_THRESHOLD);
        assert_eq!(result.recommendation, Recommendation::Proceed);
    }

    #[test]
    fn missing_variable_is_detected() {
        let result = verifier().verify(&VerifyInput {
            expected_variables: vec!["df".into()],
            current_variables: vec!["x".into()],
            ..ok_input()
        });

        assert!(result
            .mismatches
            .iter()
            .any(|m| m.mismatch_type == MismatchType::VariableMissing));
        assert!(result.confidence < PROCEED_THRESHOLD);
    }

    #[test]
    fn partial_variable_creation_counts_each_miss() {
        let result = verifier().verify(&VerifyInput {
            expected_variables: vec!["df".into(), "result".into(), "summary".into()],
            current_variables: vec!["df".into()],
            ..ok_input()
        });

        let missing = result
            .mismatches
            .iter()
            .filter(|m| m.mismatch_type == MismatchType::VariableMissing)
            .count();
        assert_eq!(missing, 2);
        let factor = result.confidence_details.factors.variable_creation;
        assert!((factor - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn output_patterns_match_as_regex() {
        let result = verifier().verify(&VerifyInput {
            execution_output: "   col1  col2\n0     1     2".into(),
            expected_output_patterns: vec!["col1".into(), "col2".into()],
            ..ok_input()
        });

        assert!(result.is_valid);
        assert!(!result
            .mismatches
            .iter()
            .any(|m| m.mismatch_type == MismatchType::OutputMismatch));
    }

    #[test]
    fn unmatched_patterns_create_minor_mismatches() {
        let result = verifier().verify(&VerifyInput {
            execution_output: "hello".into(),
            expected_output_patterns: vec!["DataFrame".into(), "columns".into()],
            ..ok_input()
        });

        let mismatches: Vec<_> = result
            .mismatches
            .iter()
            .filter(|m| m.mismatch_type == MismatchType::OutputMismatch)
            .collect();
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches.iter().all(|m| m.severity == Severity::Minor));
    }

    #[test]
    fn execution_error_is_critical_and_escalates() {
        let result = verifier().verify(&VerifyInput {
            execution_status: ExecutionStatus::Error,
            error_message: Some("ZeroDivisionError: division by zero".into()),
            ..ok_input()
        });

        assert!(!result.is_valid);
        assert_eq!(result.recommendation, Recommendation::Escalate);
        let exception = result
            .mismatches
            .iter()
            .find(|m| m.mismatch_type == MismatchType::ExceptionOccurred)
            .expect("exception mismatch present");
        assert_eq!(exception.severity, Severity::Critical);
        // no_exceptions (0.25) and execution_complete (0.15) are lost.
        assert!((result.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn import_error_adds_import_failed_mismatch() {
        let result = verifier().verify(&VerifyInput {
            execution_status: ExecutionStatus::Error,
            error_message: Some("ModuleNotFoundError: No module named 'nonexistent'".into()),
            ..ok_input()
        });

        let import_failed = result
            .mismatches
            .iter()
            .find(|m| m.mismatch_type == MismatchType::ImportFailed)
            .expect("import mismatch present");
        assert!(import_failed.description.contains("nonexistent"));
    }

    #[test]
    fn suggestions_match_error_kind() {
        let cases = [
            ("ModuleNotFoundError: no module", "pip install"),
            ("NameError: name 'x' is not defined", "variable"),
            ("FileNotFoundError: missing.csv", "file path"),
            ("TypeError: unsupported operand", "types"),
            ("KeyError: 'col'", "key"),
        ];

        for (message, keyword) in cases {
            let result = verifier().verify(&VerifyInput {
                execution_status: ExecutionStatus::Error,
                error_message: Some(message.to_string()),
                ..ok_input()
            });
            let suggestion = result
                .mismatches
                .iter()
                .find(|m| m.mismatch_type == MismatchType::ExceptionOccurred)
                .and_then(|m| m.suggestion.clone())
                .expect("suggestion present");
            assert!(
                suggestion.contains(keyword),
                "suggestion {suggestion:?} for {message:?}"
            );
        }
    }

    #[test]
    fn clean_run_without_expectations_scores_full_confidence() {
        let result = verifier().verify(&ok_input());
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(result.recommendation, Recommendation::Proceed);
    }

    #[test]
    fn history_is_bounded_and_recorded() {
        let v = verifier();
        for i in 0..(HISTORY_CAPACITY + 10) {
            v.verify(&VerifyInput {
                step_number: i as u32 + 1,
                ..ok_input()
            });
        }
        assert_eq!(v.history().len(), HISTORY_CAPACITY);

        v.clear_history();
        assert!(v.history().is_empty());
    }

    #[test]
    fn trend_reports_average_and_criticals() {
        let v = verifier();
        for _ in 0..3 {
            v.verify(&ok_input());
        }
        v.verify(&VerifyInput {
            execution_status: ExecutionStatus::Error,
            error_message: Some("ValueError: bad".into()),
            ..ok_input()
        });

        let trend = v.analyze_trend();
        assert_eq!(trend.samples, 4);
        assert_eq!(trend.critical_count, 1);
        assert!(trend.average < 1.0);
        assert!(trend.trend < 0.0);
    }
}
