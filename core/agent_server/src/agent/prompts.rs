//! Prompt assembly for every LLM task the orchestrator issues. Templates
//! always name the JSON output shape in the body and never emit sections
//! for data the caller did not supply.

use shared_types::{ExecutionError, NotebookContext, Step};

const RECENT_CELL_SOURCE_LIMIT: usize = 300;

const PLAN_OUTPUT_SCHEMA: &str = r#"## Output format (JSON)

```json
{
  "reasoning": "why the plan is structured this way",
  "plan": {
    "totalSteps": <number of steps>,
    "steps": [
      {
        "stepNumber": 1,
        "description": "step description",
        "toolCalls": [
          {"tool": "jupyter_cell", "parameters": {"code": "Python code"}}
        ],
        "dependencies": []
      },
      {
        "stepNumber": <N>,
        "description": "present the final result",
        "toolCalls": [
          {"tool": "final_answer", "parameters": {"answer": "completion message"}}
        ],
        "dependencies": [<N-1>]
      }
    ]
  }
}
```

Output only the JSON. No other text."#;

const REFINE_OUTPUT_SCHEMA: &str = r#"## Output format (JSON)

```json
{
  "reasoning": "error analysis and how the fix addresses it",
  "toolCalls": [
    {"tool": "jupyter_cell", "parameters": {"code": "corrected Python code"}}
  ]
}
```

Output only the JSON."#;

const REPLAN_OUTPUT_SCHEMA: &str = r#"## Output format (JSON)

```json
{
  "analysis": {
    "root_cause": "root cause analysis",
    "is_approach_problem": true,
    "missing_prerequisites": ["missing prerequisite work"]
  },
  "decision": "refine | insert_steps | replace_step | replan_remaining",
  "reasoning": "why this decision",
  "changes": {
    "refined_code": "corrected code (decision: refine)",
    "new_steps": [
      {
        "description": "install the package named in the error message",
        "toolCalls": [{"tool": "jupyter_cell", "parameters": {"code": "!pip install <package-from-error>"}}]
      }
    ],
    "replacement": {
      "description": "new step description (decision: replace_step)",
      "toolCalls": [{"tool": "jupyter_cell", "parameters": {"code": "code"}}]
    },
    "new_plan": [
      {
        "description": "step description (decision: replan_remaining; must end with final_answer)",
        "toolCalls": [{"tool": "jupyter_cell", "parameters": {"code": "code"}}]
      }
    ]
  }
}
```

Output only the JSON."#;

const ERROR_ANALYSIS_OUTPUT_SCHEMA: &str = r#"## Output format (JSON)

```json
{
  "analysis": {
    "root_cause": "root cause analysis",
    "is_approach_problem": false,
    "missing_prerequisites": []
  },
  "decision": "refine | insert_steps | replace_step | replan_remaining",
  "reasoning": "why this decision",
  "confidence": 0.0,
  "changes": {}
}
```

Output only the JSON."#;

const REFLECTION_OUTPUT_SCHEMA: &str = r#"## Output format (JSON)

```json
{
  "evaluation": {
    "checkpoint_passed": true,
    "output_matches_expected": true,
    "confidence_score": 0.0
  },
  "analysis": {
    "success_factors": [],
    "failure_factors": [],
    "unexpected_outcomes": []
  },
  "impact_on_remaining": {
    "affected_steps": [],
    "severity": "none | minor | major | critical",
    "description": ""
  },
  "recommendations": {
    "action": "continue | adjust | retry | replan",
    "adjustments": [],
    "reasoning": ""
  }
}
```

Output only the JSON."#;

fn list_or(items: &[String], fallback: &str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join(", ")
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn notebook_section(ctx: &NotebookContext) -> String {
    let mut section = String::new();
    section.push_str("## Notebook context\n\n");
    section.push_str(&format!("- Cell count: {}\n", ctx.cell_count));
    section.push_str(&format!(
        "- Imported libraries: {}\n",
        list_or(&ctx.imported_libraries, "none")
    ));
    section.push_str(&format!(
        "- Defined variables: {}\n",
        list_or(&ctx.defined_variables, "none")
    ));

    if ctx.recent_cells.is_empty() {
        section.push_str("- Recent cells: none\n");
    } else {
        section.push_str("- Recent cells:\n");
        for (i, cell) in ctx.recent_cells.iter().enumerate() {
            let index = cell.index.unwrap_or(i as u32);
            let kind = match cell.kind {
                shared_types::CellKind::Code => "code",
                shared_types::CellKind::Markdown => "markdown",
            };
            section.push_str(&format!(
                "\n[cell {index}] ({kind}):\n```\n{}\n```\n",
                truncate_chars(&cell.source, RECENT_CELL_SOURCE_LIMIT)
            ));
        }
    }
    section
}

fn executed_steps_section(steps: &[Step]) -> String {
    if steps.is_empty() {
        return "none".to_string();
    }
    steps
        .iter()
        .map(|s| format!("- Step {}: {} ✅", s.step_number, s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn error_section(error: &ExecutionError) -> String {
    let mut section = String::new();
    section.push_str(&format!("- Error type: {}\n", error.kind));
    section.push_str(&format!("- Error message: {}\n", error.message));
    if !error.traceback.is_empty() {
        section.push_str(&format!(
            "- Traceback:\n```\n{}\n```\n",
            error.traceback_text()
        ));
    }
    section
}

/// Plan prompt: request, notebook context, environment, guardrails, and any
/// detected library guides inlined before the output schema.
pub fn format_plan_prompt(
    request: &str,
    ctx: &NotebookContext,
    installed_packages: &[String],
    knowledge_section: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are a Python expert working inside a Jupyter notebook.\n\
         Analyze the user's request and produce a step-by-step execution plan as JSON.\n\n",
    );

    prompt.push_str(
        "## Available tools\n\n\
         1. **jupyter_cell**: create and run a Python code cell\n   \
            - parameters: {\"code\": \"Python code\"}\n\
         2. **markdown**: create a markdown explanation cell\n   \
            - parameters: {\"content\": \"markdown text\"}\n\
         3. **final_answer**: finish the task with a final answer\n   \
            - parameters: {\"answer\": \"final answer text\", \"summary\": \"optional summary\"}\n\n",
    );

    prompt.push_str(&notebook_section(ctx));

    prompt.push_str(&format!(
        "\n## Environment\n\n- Installed packages: {}\n",
        list_or(installed_packages, "unknown")
    ));

    prompt.push_str(&format!("\n## User request\n\n{request}\n"));

    prompt.push_str(
        "\n## Instructions\n\n\
         1. Break the request into logical steps (at most 10)\n\
         2. Every step needs a clear goal and at least one tool call\n\
         3. Code must be immediately executable; include every needed import\n\
         4. The last step must contain exactly one final_answer call\n\n\
         ## Library consistency (critical)\n\n\
         When the user names a specific library, use it in every step.\n\
         \"analyze with dask\" means dask everywhere; never silently switch to pandas.\n\n\
         ## File discovery\n\n\
         When the request names a file, first locate it \
         (e.g. glob.glob('**/name.csv', recursive=True)), verify it exists with \
         os.path.exists(), and print the resolved path before loading.\n\n\
         ## Validate data before plotting\n\n\
         Plotting an empty selection raises IndexError. Check len(data) > 0 before \
         calling .plot() and print a message instead when there is nothing to draw.\n",
    );

    if !knowledge_section.is_empty() {
        prompt.push_str(knowledge_section);
        prompt.push('\n');
    }

    prompt.push_str(PLAN_OUTPUT_SCHEMA);
    prompt
}

/// Refine prompt: the failed code plus the rules that forbid library
/// substitution for module errors.
pub fn format_refine_prompt(
    original_code: &str,
    error: &ExecutionError,
    attempt: u32,
    max_attempts: u32,
    installed_packages: &[String],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("The following code failed. Provide a corrected version.\n\n");
    prompt.push_str(&format!("## Original code\n\n```python\n{original_code}\n```\n\n"));
    prompt.push_str("## Error\n\n");
    prompt.push_str(&error_section(error));
    prompt.push_str(&format!("\n## Attempt\n\n{attempt}/{max_attempts}\n"));
    prompt.push_str(&format!(
        "\n## Environment\n\n- Installed packages: {}\n",
        list_or(installed_packages, "unknown")
    ));

    prompt.push_str(
        "\n## Rules (must not be violated)\n\n\
         **ModuleNotFoundError / ImportError**: never substitute a different library. \
         If `import dask` fails, do NOT rewrite the code to use pandas; missing packages \
         are installed by the system, not fixed here. For these errors return the original \
         code unchanged.\n\n\
         **Fixable here**: SyntaxError, TypeError, ValueError, KeyError, IndexError, \
         AttributeError, NameError (typos), UnicodeDecodeError (add an encoding argument).\n\n\
         **Not fixable here**: ModuleNotFoundError, ImportError, FileNotFoundError \
         (path problems are handled elsewhere).\n\n\
         Analyze the root cause, fix the code, and make sure the same error cannot repeat.\n\n",
    );

    prompt.push_str(REFINE_OUTPUT_SCHEMA);
    prompt
}

/// Replan prompt: full failure context plus the mandatory override rules.
#[allow(clippy::too_many_arguments)]
pub fn format_replan_prompt(
    original_request: &str,
    executed_steps: &[Step],
    failed_step: &Step,
    error: &ExecutionError,
    execution_output: &str,
    installed_packages: &[String],
    install_command_example: &str,
) -> String {
    let failed_code = failed_step.code().unwrap_or("");
    let mut prompt = String::new();

    prompt.push_str(
        "A step failed. Analyze the output and the error, then decide how to adapt the plan.\n\n",
    );
    prompt.push_str(&format!("## Original request\n\n{original_request}\n\n"));
    prompt.push_str(&format!(
        "## Steps executed so far\n\n{}\n\n",
        executed_steps_section(executed_steps)
    ));
    prompt.push_str(&format!(
        "## Failed step\n\n- Step number: {}\n- Description: {}\n- Executed code:\n```python\n{failed_code}\n```\n\n",
        failed_step.step_number, failed_step.description
    ));
    prompt.push_str("## Error\n\n");
    prompt.push_str(&error_section(error));
    prompt.push_str(&format!(
        "\n## Execution output (stdout/stderr)\n\n```\n{}\n```\n",
        if execution_output.is_empty() {
            "none"
        } else {
            execution_output
        }
    ));
    prompt.push_str(&format!(
        "\n## Environment\n\n- Installed packages: {}\n",
        list_or(installed_packages, "unknown")
    ));

    prompt.push_str(&format!(
        "\n## Mandatory rules (never violate these)\n\n\
         ### ModuleNotFoundError / ImportError always means `insert_steps`\n\n\
         - `refine`, `replace_step`, and `replan_remaining` are forbidden for these errors.\n\
         - Extract the package name **from the error message, not from the user's code**.\n  \
           Example: `import dask.dataframe as dd` failing with \
           `No module named 'pyarrow'` means pyarrow is a dask-internal dependency: \
           install pyarrow, keep the dask code unchanged.\n\
         - Add a step running `{install_command_example}` with the extracted package.\n\
         - Reduce `a.b.c` to the top-level package `a`; map known aliases \
           (sklearn → scikit-learn, cv2 → opencv-python, PIL → pillow).\n\
         - Never abbreviate the install command or any index URL; emit it in full, \
           exactly as configured, or it will not run.\n\
         - If the package from the error message already appears in the installed \
           packages list, do not add an install step; the failure is elsewhere.\n\n\
         ### Other error kinds\n\n\
         - FileNotFoundError: add a step that locates/verifies the file path.\n\
         - NameError: if a prior step should have defined the name, insert that \
           definition; a plain typo is a `refine`.\n\
         - TypeError / ValueError: usually `refine` with corrected code.\n\n\
         ## Decision options\n\n\
         1. `refine` — same approach, corrected code (forbidden for module errors)\n\
         2. `insert_steps` — add prerequisite steps before the failed one \
            (the only option for module errors)\n\
         3. `replace_step` — swap the failed step for a different approach\n\
         4. `replan_remaining` — rewrite every remaining step, ending with a new \
            final_answer that reflects what was actually used\n\n",
    ));

    prompt.push_str(REPLAN_OUTPUT_SCHEMA);
    prompt
}

/// Step-level self-evaluation against checkpoint expectations.
pub fn format_reflection_prompt(
    step: &Step,
    execution_status: &str,
    execution_output: &str,
    error_message: Option<&str>,
    remaining_steps: &[Step],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("Analyze the execution result and propose adjustments for what remains.\n\n");
    prompt.push_str(&format!(
        "## Executed step\n\n- Step number: {}\n- Description: {}\n- Code:\n```python\n{}\n```\n\n",
        step.step_number,
        step.description,
        step.code().unwrap_or("")
    ));
    prompt.push_str(&format!(
        "## Result\n\n- Status: {execution_status}\n- Output:\n```\n{}\n```\n",
        if execution_output.is_empty() {
            "none"
        } else {
            execution_output
        }
    ));
    if let Some(message) = error_message {
        prompt.push_str(&format!("- Error:\n```\n{message}\n```\n"));
    }

    if let Some(checkpoint) = &step.checkpoint {
        prompt.push_str("\n## Checkpoint\n\n");
        if let Some(expected) = &checkpoint.expected_outcome {
            prompt.push_str(&format!("- Expected outcome: {expected}\n"));
        }
        if !checkpoint.validation_criteria.is_empty() {
            prompt.push_str("- Validation criteria:\n");
            for criterion in &checkpoint.validation_criteria {
                prompt.push_str(&format!("  - {criterion}\n"));
            }
        }
    }

    prompt.push_str(&format!(
        "\n## Remaining steps\n\n{}\n\n",
        executed_steps_section(remaining_steps).replace(" ✅", "")
    ));

    prompt.push_str(REFLECTION_OUTPUT_SCHEMA);
    prompt
}

/// Concise completion summary over the executed steps and their outputs.
pub fn format_final_answer_prompt(
    original_request: &str,
    executed_steps: &[Step],
    outputs: &[String],
) -> String {
    let outputs_text = if outputs.is_empty() {
        "none".to_string()
    } else {
        outputs
            .iter()
            .enumerate()
            .map(|(i, o)| format!("[output {}]: {}", i + 1, truncate_chars(o, 200)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "The task is complete. Summarize the results.\n\n\
         ## Original request\n\n{original_request}\n\n\
         ## Executed steps\n\n{}\n\n\
         ## Outputs\n\n{outputs_text}\n\n\
         ## Instructions\n\n\
         1. Summarize what was done, concisely\n\
         2. Highlight the key findings\n\
         3. Suggest a next step if one is obvious\n\n\
         Output plain text, at most 200 characters.",
        executed_steps_section(executed_steps).replace(" ✅", "")
    )
}

/// Classifier fallback prompt: produce an ErrorAnalysis-shaped object.
pub fn format_error_analysis_prompt(
    error_kind: &str,
    error_message: &str,
    traceback: &str,
    installed_packages: &[String],
) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "An executed notebook step failed in a way the deterministic classifier could \
         not resolve. Analyze the error and choose a recovery decision.\n\n",
    );
    prompt.push_str(&format!(
        "## Error\n\n- Error type: {error_kind}\n- Error message: {error_message}\n"
    ));
    if !traceback.is_empty() {
        prompt.push_str(&format!("- Traceback:\n```\n{traceback}\n```\n"));
    }
    prompt.push_str(&format!(
        "\n## Environment\n\n- Installed packages: {}\n\n",
        list_or(installed_packages, "unknown")
    ));
    prompt.push_str(
        "Rules: ModuleNotFoundError/ImportError must be `insert_steps`; never substitute \
         libraries; `confidence` reflects how certain the analysis is.\n\n",
    );
    prompt.push_str(ERROR_ANALYSIS_OUTPUT_SCHEMA);
    prompt
}

/// Condense a dropped conversation prefix into a few sentences.
pub fn format_summary_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following conversation in at most three sentences, keeping \
         every fact a follow-up question might rely on.\n\n{transcript}\n\n\
         Output plain text only."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{CellKind, RecentCell, ToolCall};

    fn step(number: u32, description: &str, code: &str) -> Step {
        Step {
            step_number: number,
            description: description.to_string(),
            tool_calls: vec![ToolCall::jupyter_cell(code)],
            dependencies: vec![],
            checkpoint: None,
            risk_level: None,
        }
    }

    #[test]
    fn plan_prompt_includes_context_and_schema() {
        let ctx = NotebookContext {
            cell_count: 3,
            imported_libraries: vec!["pandas".into()],
            defined_variables: vec!["df".into()],
            recent_cells: vec![RecentCell {
                index: Some(2),
                kind: CellKind::Code,
                source: "df.head()".into(),
            }],
            installed_packages: vec![],
        };

        let prompt = format_plan_prompt("analyze titanic.csv", &ctx, &["pandas".into()], "");

        assert!(prompt.contains("analyze titanic.csv"));
        assert!(prompt.contains("Cell count: 3"));
        assert!(prompt.contains("Imported libraries: pandas"));
        assert!(prompt.contains("[cell 2] (code)"));
        assert!(prompt.contains("\"totalSteps\""));
        assert!(prompt.contains("final_answer"));
    }

    #[test]
    fn plan_prompt_inlines_knowledge_before_schema() {
        let ctx = NotebookContext::default();
        let prompt = format_plan_prompt("use dask", &ctx, &[], "## DASK GUIDE HERE\n");

        let guide_pos = prompt.find("DASK GUIDE HERE").expect("guide present");
        let schema_pos = prompt.find("Output format (JSON)").expect("schema present");
        assert!(guide_pos < schema_pos);
    }

    #[test]
    fn plan_prompt_omits_optional_sections() {
        let prompt = format_plan_prompt("hello", &NotebookContext::default(), &[], "");
        assert!(prompt.contains("Installed packages: unknown"));
        assert!(prompt.contains("Recent cells: none"));
    }

    #[test]
    fn refine_prompt_carries_attempt_counter_and_rules() {
        let error = ExecutionError {
            kind: "UnicodeDecodeError".into(),
            message: "'utf-8' codec can't decode byte".into(),
            traceback: vec!["Traceback...".into()],
        };
        let prompt =
            format_refine_prompt("df = pd.read_csv('data.csv')", &error, 2, 3, &["pandas".into()]);

        assert!(prompt.contains("2/3"));
        assert!(prompt.contains("UnicodeDecodeError"));
        assert!(prompt.contains("never substitute a different library"));
        assert!(prompt.contains("\"toolCalls\""));
    }

    #[test]
    fn replan_prompt_contains_mandatory_override_rules() {
        let failed = step(1, "load with dask", "import dask.dataframe as dd");
        let error = ExecutionError {
            kind: "ModuleNotFoundError".into(),
            message: "No module named 'pyarrow'".into(),
            traceback: vec![],
        };

        let prompt = format_replan_prompt(
            "load train.csv with dask",
            &[],
            &failed,
            &error,
            "ModuleNotFoundError...",
            &["dask".into()],
            "!pip install --index-url https://nexus.example.com/repository/pypi/simple --timeout 180 <package>",
        );

        assert!(prompt.contains("from the error message, not from the user's code"));
        assert!(prompt.contains("Never abbreviate the install command"));
        assert!(prompt.contains("https://nexus.example.com/repository/pypi/simple"));
        assert!(prompt.contains("insert_steps"));
        assert!(prompt.contains("pyarrow is a dask-internal dependency"));
    }

    #[test]
    fn replan_prompt_marks_executed_steps() {
        let executed = vec![step(1, "install dask", "!pip install dask")];
        let failed = step(2, "load data", "dd.read_csv('x.csv')");
        let error = ExecutionError {
            kind: "ValueError".into(),
            message: "bad".into(),
            traceback: vec![],
        };

        let prompt =
            format_replan_prompt("req", &executed, &failed, &error, "", &[], "!pip install");
        assert!(prompt.contains("Step 1: install dask ✅"));
    }

    #[test]
    fn error_analysis_prompt_names_schema() {
        let prompt = format_error_analysis_prompt("CustomError", "boom", "", &[]);
        assert!(prompt.contains("\"decision\""));
        assert!(prompt.contains("\"confidence\""));
        assert!(prompt.contains("insert_steps"));
    }

    #[test]
    fn final_answer_prompt_truncates_long_outputs() {
        let long_output = "x".repeat(500);
        let prompt = format_final_answer_prompt("req", &[], &[long_output]);
        assert!(!prompt.contains(&"x".repeat(300)));
        assert!(prompt.contains(&"x".repeat(200)));
    }
}
