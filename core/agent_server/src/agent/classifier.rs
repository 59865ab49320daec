//! Deterministic error classification. No LLM call on the common path; the
//! fallback is consulted only for repeated, unknown, or chained errors and
//! its answer is discarded whenever it cannot be parsed.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use shared_types::{ErrorAnalysis, PlanChanges, ReplanDecision, StepDraft, ToolCall};

use crate::agent::prompts;
use crate::agent::salvage::salvage_json;
use crate::config_service::LlmConfig;
use crate::llm::LlmGateway;

/// import name → pip distribution name.
static PACKAGE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("sklearn", "scikit-learn"),
        ("cv2", "opencv-python"),
        ("PIL", "pillow"),
        ("yaml", "pyyaml"),
        ("bs4", "beautifulsoup4"),
        ("skimage", "scikit-image"),
        ("dotenv", "python-dotenv"),
        ("dateutil", "python-dateutil"),
    ])
});

/// Error kinds that resolve with a code fix. Module errors are handled
/// before this table is consulted; OSError has its own dlopen carve-out.
static REFINABLE_KINDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "SyntaxError",
        "TypeError",
        "ValueError",
        "KeyError",
        "IndexError",
        "AttributeError",
        "NameError",
        "ZeroDivisionError",
        "FileNotFoundError",
        "PermissionError",
        "RuntimeError",
        "AssertionError",
        "StopIteration",
        "RecursionError",
        "MemoryError",
        "OverflowError",
        "FloatingPointError",
        "UnicodeError",
        "UnicodeDecodeError",
        "UnicodeEncodeError",
        "OSError",
        "ModuleNotFoundError",
        "ImportError",
    ]
});

/// Missing system library patterns (macOS dylib, Linux .so, Windows .dll).
static DLOPEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?is)dlopen\([^)]+\).*Library not loaded.*?(\w+\.dylib)").expect("dylib"),
        Regex::new(r"(?is)cannot open shared object file.*?lib(\w+)\.so").expect("so"),
        Regex::new(r"(?is)DLL load failed.*?(\w+\.dll)").expect("dll"),
    ]
});

/// Ordered extraction patterns for the missing module name.
static MODULE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)ModuleNotFoundError: No module named ['"]([^'"]+)['"]"#).expect("mnfe"),
        Regex::new(r#"(?i)ImportError: No module named ['"]([^'"]+)['"]"#).expect("ie"),
        Regex::new(r#"(?i)ImportError: cannot import name ['"]([^'"]+)['"]"#).expect("ie name"),
        Regex::new(r#"(?i)No module named ['"]([^'"]+)['"]"#).expect("bare"),
    ]
});

static EXCEPTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\w+(Error|Exception):").expect("exception line"));

const CHAINED_EXCEPTION_MARKER: &str = "During handling of the above exception";

pub struct ErrorClassifier {
    pip_index_option: String,
}

impl ErrorClassifier {
    pub fn new(pip_index_option: impl Into<String>) -> Self {
        Self {
            pip_index_option: pip_index_option.into(),
        }
    }

    /// Classify one execution failure into a recovery decision.
    pub fn classify(
        &self,
        error_kind: &str,
        error_message: &str,
        traceback: &str,
        installed_packages: &[String],
    ) -> ErrorAnalysis {
        let installed_lower: Vec<String> =
            installed_packages.iter().map(|p| p.to_lowercase()).collect();

        let kind = normalize_error_kind(error_kind);

        if kind == "ModuleNotFoundError" || kind == "ImportError" {
            return self.classify_module_error(error_message, traceback, &installed_lower);
        }

        if kind == "OSError" {
            return self.classify_os_error(error_message, traceback);
        }

        let known = REFINABLE_KINDS.contains(&kind.as_str());
        ErrorAnalysis {
            decision: ReplanDecision::Refine,
            root_cause: describe_error(&kind, error_message),
            reasoning: if known {
                format!("{kind} is recoverable by fixing the code with the same approach.")
            } else {
                format!("Unknown error kind {kind}; attempting a code fix.")
            },
            missing_package: None,
            changes: PlanChanges::default(),
            used_llm: false,
            confidence: 1.0,
        }
    }

    /// Module errors always resolve by installing the package named in the
    /// error message, never the one named in the user's code.
    fn classify_module_error(
        &self,
        error_message: &str,
        traceback: &str,
        installed_lower: &[String],
    ) -> ErrorAnalysis {
        let full_text = format!("{error_message}\n{traceback}");

        let Some(missing) = extract_missing_package(&full_text) else {
            return ErrorAnalysis {
                decision: ReplanDecision::Refine,
                root_cause: "import failed but no package name could be extracted".to_string(),
                reasoning: "Without a package name the import statement itself is suspect."
                    .to_string(),
                missing_package: None,
                changes: PlanChanges::default(),
                used_llm: false,
                confidence: 1.0,
            };
        };

        let pip_name = pip_package_name(&missing);

        if installed_lower.contains(&pip_name.to_lowercase()) {
            return ErrorAnalysis {
                decision: ReplanDecision::Refine,
                root_cause: format!("import of '{missing}' failed although {pip_name} is installed"),
                reasoning: "The package is present, so the import statement or code is at fault."
                    .to_string(),
                missing_package: None,
                changes: PlanChanges::default(),
                used_llm: false,
                confidence: 1.0,
            };
        }

        let install_command = self.pip_install_command(&pip_name);

        ErrorAnalysis {
            decision: ReplanDecision::InsertSteps,
            root_cause: format!("module '{missing}' is not installed"),
            reasoning: "A missing module is always resolved by installing the package first."
                .to_string(),
            missing_package: Some(pip_name.clone()),
            changes: PlanChanges {
                new_steps: vec![StepDraft {
                    description: format!("Install the {pip_name} package"),
                    tool_calls: vec![ToolCall::jupyter_cell(install_command)],
                }],
                ..PlanChanges::default()
            },
            used_llm: false,
            confidence: 1.0,
        }
    }

    /// dlopen-style failures are system-level; pip cannot fix them.
    fn classify_os_error(&self, error_message: &str, traceback: &str) -> ErrorAnalysis {
        let full_text = format!("{error_message}\n{traceback}");

        for pattern in DLOPEN_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(&full_text) {
                let missing_lib = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return ErrorAnalysis {
                    decision: ReplanDecision::ReplanRemaining,
                    root_cause: format!("missing system library: {missing_lib}"),
                    reasoning:
                        "A dynamic loader failure needs a system package manager, not pip; \
                         the remaining steps must route around it."
                            .to_string(),
                    missing_package: None,
                    changes: PlanChanges {
                        system_dependency: Some(missing_lib),
                        ..PlanChanges::default()
                    },
                    used_llm: false,
                    confidence: 1.0,
                };
            }
        }

        ErrorAnalysis {
            decision: ReplanDecision::Refine,
            root_cause: format!("OSError: {}", truncate(error_message, 150)),
            reasoning: "A plain OSError is worth one code-level fix attempt.".to_string(),
            missing_package: None,
            changes: PlanChanges::default(),
            used_llm: false,
            confidence: 1.0,
        }
    }

    pub fn pip_install_command(&self, package: &str) -> String {
        if self.pip_index_option.is_empty() {
            format!("!pip install --timeout 180 {package}")
        } else {
            format!(
                "!pip install {} --timeout 180 {package}",
                self.pip_index_option
            )
        }
    }

    /// Decide whether the LLM fallback applies. Returns the trigger reason.
    pub fn should_use_llm_fallback(
        &self,
        error_kind: &str,
        traceback: &str,
        previous_attempts: u32,
    ) -> Option<String> {
        if previous_attempts >= 2 {
            return Some(format!(
                "same error repeated {previous_attempts} times in a row"
            ));
        }

        let kind = normalize_error_kind(error_kind);
        if !REFINABLE_KINDS.contains(&kind.as_str()) {
            return Some(format!("unknown error kind {kind}"));
        }

        if count_exception_blocks(traceback) >= 2 {
            return Some("traceback chains multiple exceptions".to_string());
        }

        None
    }

    /// Classify with the optional LLM fallback. Any failure along the
    /// fallback path returns the deterministic result.
    pub async fn classify_with_fallback(
        &self,
        error_kind: &str,
        error_message: &str,
        traceback: &str,
        installed_packages: &[String],
        previous_attempts: u32,
        gateway: Option<(&LlmGateway, &LlmConfig)>,
    ) -> ErrorAnalysis {
        let deterministic =
            self.classify(error_kind, error_message, traceback, installed_packages);

        let Some(reason) = self.should_use_llm_fallback(error_kind, traceback, previous_attempts)
        else {
            return deterministic;
        };

        let Some((gateway, llm_cfg)) = gateway else {
            return deterministic;
        };

        info!(reason = %reason, "consulting LLM fallback for error classification");
        platform::record_counter("classifier_llm_fallback_total", 1);

        let prompt =
            prompts::format_error_analysis_prompt(error_kind, error_message, traceback, installed_packages);

        match gateway.generate(llm_cfg, &prompt, None).await {
            Ok(content) => self.parse_llm_analysis(&content),
            Err(e) => {
                warn!(error = %e, "LLM fallback failed, using deterministic result");
                ErrorAnalysis {
                    reasoning: format!("{} (LLM fallback failed)", deterministic.reasoning),
                    ..deterministic
                }
            }
        }
    }

    /// Parse the fallback answer into an `ErrorAnalysis`. Unparsable content
    /// degrades to a low-confidence REFINE.
    pub fn parse_llm_analysis(&self, content: &str) -> ErrorAnalysis {
        let Some(value) = salvage_json(content) else {
            return ErrorAnalysis {
                decision: ReplanDecision::Refine,
                root_cause: "LLM analysis was not parseable".to_string(),
                reasoning: "Falling back to a code fix attempt.".to_string(),
                missing_package: None,
                changes: PlanChanges::default(),
                used_llm: true,
                confidence: 0.3,
            };
        };

        let decision = value
            .get("decision")
            .and_then(Value::as_str)
            .and_then(parse_decision)
            .unwrap_or(ReplanDecision::Refine);

        let root_cause = value
            .get("analysis")
            .and_then(|a| a.get("root_cause"))
            .and_then(Value::as_str)
            .unwrap_or("analysis missing")
            .to_string();

        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.7)
            .clamp(0.0, 1.0);

        let changes = value
            .get("changes")
            .cloned()
            .map(|c| serde_json::from_value(c).unwrap_or_default())
            .unwrap_or_default();

        ErrorAnalysis {
            decision,
            root_cause,
            reasoning,
            missing_package: None,
            changes,
            used_llm: true,
            confidence,
        }
    }
}

pub fn parse_decision(raw: &str) -> Option<ReplanDecision> {
    match raw {
        "refine" => Some(ReplanDecision::Refine),
        "insert_steps" => Some(ReplanDecision::InsertSteps),
        "replace_step" => Some(ReplanDecision::ReplaceStep),
        "replan_remaining" => Some(ReplanDecision::ReplanRemaining),
        _ => None,
    }
}

/// `'builtins.ValueError: bad'` → `ValueError`. Empty input becomes
/// `RuntimeError`.
pub fn normalize_error_kind(error_kind: &str) -> String {
    let trimmed = error_kind.trim();
    if trimmed.is_empty() {
        return "RuntimeError".to_string();
    }

    let before_colon = trimmed.split(':').next().unwrap_or(trimmed).trim();
    let after_dot = before_colon.rsplit('.').next().unwrap_or(before_colon);
    after_dot.to_string()
}

/// Pull the missing module out of the error text and reduce `a.b.c` → `a`.
pub fn extract_missing_package(text: &str) -> Option<String> {
    for pattern in MODULE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let package = caps.get(1)?.as_str();
            return Some(package.split('.').next().unwrap_or(package).to_string());
        }
    }
    None
}

pub fn pip_package_name(import_name: &str) -> String {
    PACKAGE_ALIASES
        .get(import_name)
        .map(|s| s.to_string())
        .unwrap_or_else(|| import_name.to_string())
}

/// Count distinct exception blocks in a traceback; chained-exception
/// markers count as blocks of their own.
pub fn count_exception_blocks(traceback: &str) -> usize {
    if traceback.trim().is_empty() {
        return 0;
    }
    let lines = EXCEPTION_LINE.find_iter(traceback).count();
    let markers = traceback.matches(CHAINED_EXCEPTION_MARKER).count();
    lines + markers
}

fn describe_error(kind: &str, message: &str) -> String {
    let base = match kind {
        "SyntaxError" => "syntax error",
        "TypeError" => "type mismatch",
        "ValueError" => "invalid value",
        "KeyError" => "missing dictionary or dataframe key",
        "IndexError" => "index out of range",
        "AttributeError" => "missing attribute or method",
        "NameError" => "undefined variable",
        "FileNotFoundError" => "file not found",
        "ZeroDivisionError" => "division by zero",
        "PermissionError" => "permission denied",
        "RuntimeError" => "runtime error",
        "MemoryError" => "out of memory",
        other => other,
    };
    format!("{base}: {}", truncate(message, 150))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new("")
    }

    #[test]
    fn missing_module_yields_insert_steps_with_pip_command() {
        let analysis = classifier().classify(
            "ModuleNotFoundError",
            "No module named 'dask'",
            "",
            &["pandas".into(), "numpy".into()],
        );

        assert_eq!(analysis.decision, ReplanDecision::InsertSteps);
        assert_eq!(analysis.missing_package.as_deref(), Some("dask"));
        assert!(!analysis.used_llm);

        let code = analysis.changes.new_steps[0].tool_calls[0]
            .code()
            .expect("install step has code");
        assert!(code.starts_with("!pip install"));
        assert!(code.contains("dask"));
    }

    #[test]
    fn installed_module_downgrades_to_refine() {
        let analysis = classifier().classify(
            "ModuleNotFoundError",
            "No module named 'pyarrow'",
            "",
            &["pyarrow".into()],
        );
        assert_eq!(analysis.decision, ReplanDecision::Refine);
        assert!(analysis.missing_package.is_none());
    }

    #[test]
    fn indirect_dependency_installs_package_from_error_message() {
        // Code imported dask, the loader tripped over pyarrow.
        let traceback = "File \"dask/dataframe/io/parquet/arrow.py\", line 15\n\
                         import pyarrow\nModuleNotFoundError: No module named 'pyarrow'";
        let analysis = classifier().classify(
            "ModuleNotFoundError",
            "No module named 'pyarrow'",
            traceback,
            &["dask".into()],
        );

        assert_eq!(analysis.decision, ReplanDecision::InsertSteps);
        assert_eq!(analysis.missing_package.as_deref(), Some("pyarrow"));
        let code = analysis.changes.new_steps[0].tool_calls[0].code().unwrap();
        assert!(code.contains("pyarrow"));
        assert!(!code.contains("dask"));
    }

    #[test]
    fn alias_maps_to_pip_distribution() {
        let analysis = classifier().classify(
            "ModuleNotFoundError",
            "No module named 'sklearn'",
            "",
            &[],
        );
        assert_eq!(analysis.missing_package.as_deref(), Some("scikit-learn"));
    }

    #[test]
    fn dotted_module_reduces_to_top_level() {
        assert_eq!(
            extract_missing_package("No module named 'pyarrow.lib'").as_deref(),
            Some("pyarrow")
        );
    }

    #[test]
    fn dlopen_error_replans_with_system_dependency() {
        let analysis = classifier().classify(
            "OSError",
            "dlopen(/opt/lib/lib_lightgbm.dylib, 6): Library not loaded: @rpath/libomp.dylib",
            "",
            &[],
        );
        assert_eq!(analysis.decision, ReplanDecision::ReplanRemaining);
        assert_eq!(
            analysis.changes.system_dependency.as_deref(),
            Some("libomp.dylib")
        );
    }

    #[test]
    fn linux_shared_object_is_detected() {
        let analysis = classifier().classify(
            "OSError",
            "libgomp.so.1: cannot open shared object file lib libgomp.so: no such file",
            "",
            &[],
        );
        // Either way this must be a system dependency, not a pip install.
        assert_eq!(analysis.decision, ReplanDecision::ReplanRemaining);
        assert!(analysis.changes.system_dependency.is_some());
    }

    #[test]
    fn plain_os_error_refines() {
        let analysis = classifier().classify("OSError", "disk quota exceeded", "", &[]);
        assert_eq!(analysis.decision, ReplanDecision::Refine);
    }

    #[test]
    fn known_kinds_refine() {
        for kind in ["TypeError", "ValueError", "UnicodeDecodeError", "KeyError"] {
            let analysis = classifier().classify(kind, "boom", "", &[]);
            assert_eq!(analysis.decision, ReplanDecision::Refine, "{kind}");
            assert_eq!(analysis.confidence, 1.0);
        }
    }

    #[test]
    fn empty_kind_normalizes_to_runtime_error() {
        assert_eq!(normalize_error_kind(""), "RuntimeError");
        let analysis = classifier().classify("", "something broke", "", &[]);
        assert_eq!(analysis.decision, ReplanDecision::Refine);
    }

    #[test]
    fn kind_normalization_strips_message_and_path() {
        assert_eq!(
            normalize_error_kind("ModuleNotFoundError: No module named 'x'"),
            "ModuleNotFoundError"
        );
        assert_eq!(normalize_error_kind("builtins.ValueError"), "ValueError");
    }

    #[test]
    fn pip_index_option_is_rendered_in_full() {
        let classifier =
            ErrorClassifier::new("--index-url https://nexus.example.com/repository/pypi/simple");
        let command = classifier.pip_install_command("pyarrow");
        assert_eq!(
            command,
            "!pip install --index-url https://nexus.example.com/repository/pypi/simple \
             --timeout 180 pyarrow"
        );
    }

    #[test]
    fn fallback_triggers() {
        let c = classifier();
        assert!(c.should_use_llm_fallback("TypeError", "", 2).is_some());
        assert!(c.should_use_llm_fallback("TypeError", "", 0).is_none());
        assert!(c
            .should_use_llm_fallback("CustomUnknownError", "", 0)
            .is_some());

        let chained = "ValueError: invalid\n\
                       During handling of the above exception, another exception occurred:\n\
                       RuntimeError: failed to recover";
        assert!(c.should_use_llm_fallback("RuntimeError", chained, 0).is_some());
    }

    #[test]
    fn exception_block_counting() {
        assert_eq!(count_exception_blocks(""), 0);
        assert_eq!(count_exception_blocks("ValueError: bad literal"), 1);

        let chained = "ValueError: invalid\n\
                       During handling of the above exception, another exception occurred:\n\
                       RuntimeError: failed";
        assert!(count_exception_blocks(chained) >= 3);
    }

    #[test]
    fn llm_analysis_parsing() {
        let c = classifier();
        let parsed = c.parse_llm_analysis(
            r#"```json
{"analysis": {"root_cause": "type mismatch"}, "decision": "replace_step",
 "reasoning": "different approach", "confidence": 0.85, "changes": {}}
```"#,
        );
        assert_eq!(parsed.decision, ReplanDecision::ReplaceStep);
        assert!(parsed.used_llm);
        assert_eq!(parsed.confidence, 0.85);
        assert_eq!(parsed.root_cause, "type mismatch");
    }

    #[test]
    fn garbage_llm_answer_degrades_to_low_confidence_refine() {
        let parsed = classifier().parse_llm_analysis("this is not JSON at all");
        assert_eq!(parsed.decision, ReplanDecision::Refine);
        assert!(parsed.used_llm);
        assert_eq!(parsed.confidence, 0.3);
    }
}
