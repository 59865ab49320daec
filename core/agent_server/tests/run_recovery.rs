//! End-to-end run-loop scenarios driven through `report_execution` with a
//! scripted executor. No network: recovery paths that would consult the
//! model are exercised up to their upstream-failure handling.

use std::path::PathBuf;
use std::sync::Arc;

use agent_server::agent::AgentService;
use agent_server::config_service::{AppConfig, ConfigService};
use agent_server::error::AgentServerError;
use shared_types::{
    ExecutionError, ExecutionReport, ExecutionStatus, NotebookContext, Plan, ReportExecutionRequest,
    RunDirective, RunStatus, Step, ToolCall,
};

fn service() -> AgentService {
    let config = Arc::new(ConfigService::new(
        PathBuf::from("unused-config.toml"),
        AppConfig::default(),
    ));
    AgentService::new(config).expect("agent service builds")
}

fn dask_plan() -> Plan {
    Plan {
        total_steps: 2,
        steps: vec![
            Step {
                step_number: 1,
                description: "Load titanic.csv with dask and show the head".into(),
                tool_calls: vec![ToolCall::jupyter_cell(
                    "import dask.dataframe as dd\ndf = dd.read_csv('titanic.csv')\nprint(df.head())",
                )],
                dependencies: vec![],
                checkpoint: None,
                risk_level: None,
            },
            Step {
                step_number: 2,
                description: "Present the final result".into(),
                tool_calls: vec![ToolCall::final_answer("Loaded titanic.csv with dask.")],
                dependencies: vec![1],
                checkpoint: None,
                risk_level: None,
            },
        ],
    }
}

fn notebook_with_packages(packages: &[&str]) -> NotebookContext {
    NotebookContext {
        installed_packages: packages.iter().map(|p| p.to_string()).collect(),
        ..NotebookContext::default()
    }
}

fn ok_report() -> ExecutionReport {
    ExecutionReport {
        status: ExecutionStatus::Ok,
        stdout: String::new(),
        stderr: String::new(),
        error: None,
        new_variables: None,
        installed_packages: None,
    }
}

fn module_error_report(module: &str) -> ExecutionReport {
    ExecutionReport {
        status: ExecutionStatus::Error,
        stdout: String::new(),
        stderr: format!("ModuleNotFoundError: No module named '{module}'"),
        error: Some(ExecutionError {
            kind: "ModuleNotFoundError".into(),
            message: format!("No module named '{module}'"),
            traceback: vec![
                "Traceback (most recent call last):".into(),
                format!("ModuleNotFoundError: No module named '{module}'"),
            ],
        }),
        new_variables: None,
        installed_packages: None,
    }
}

fn report(session: &str, step_number: u32, report: ExecutionReport) -> ReportExecutionRequest {
    ReportExecutionRequest {
        session_id: session.to_string(),
        step_number,
        report,
    }
}

fn dispatched_step(directive: Option<RunDirective>) -> Step {
    match directive {
        Some(RunDirective::DispatchStep { step }) => step,
        other => panic!("expected DispatchStep, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_module_inserts_install_then_retries_and_completes() {
    let agent = service();
    agent
        .start_run(
            "s1",
            "load titanic.csv with dask and show head",
            notebook_with_packages(&["pandas", "numpy"]),
            dask_plan(),
        )
        .expect("run starts");

    // Step 1 fails: dask is not installed.
    let response = agent
        .report_execution(&report("s1", 1, module_error_report("dask")))
        .await
        .expect("report accepted");

    assert_eq!(response.run_status, RunStatus::Running);
    let install = dispatched_step(response.directive);
    assert_eq!(install.step_number, 1);
    let code = install.code().expect("install step has code");
    assert!(code.starts_with("!pip install"), "{code}");
    assert!(code.contains("dask"));

    // The install succeeds and brings dask with it.
    let mut install_ok = ok_report();
    install_ok.installed_packages = Some(vec![
        "pandas".into(),
        "numpy".into(),
        "dask".into(),
    ]);
    let response = agent
        .report_execution(&report("s1", 1, install_ok))
        .await
        .expect("report accepted");

    // The original dask step is re-dispatched, untouched.
    let retried = dispatched_step(response.directive);
    assert_eq!(retried.step_number, 2);
    assert!(retried.code().unwrap().contains("dd.read_csv"));

    // The retried step now succeeds, so the terminal step is dispatched.
    let response = agent
        .report_execution(&report("s1", 2, ok_report()))
        .await
        .expect("report accepted");
    let final_step = dispatched_step(response.directive);
    assert!(final_step.has_final_answer());

    // The final answer executes and the run completes.
    let response = agent
        .report_execution(&report("s1", 3, ok_report()))
        .await
        .expect("report accepted");
    assert_eq!(response.run_status, RunStatus::Completed);
    match response.directive {
        Some(RunDirective::RunComplete { final_answer }) => {
            assert_eq!(final_answer.as_deref(), Some("Loaded titanic.csv with dask."));
        }
        other => panic!("expected RunComplete, got {other:?}"),
    }
}

#[tokio::test]
async fn indirect_dependency_installs_package_from_error_message() {
    let agent = service();
    agent
        .start_run(
            "s2",
            "load titanic.csv with dask and show head",
            notebook_with_packages(&["pandas", "numpy", "dask"]),
            dask_plan(),
        )
        .expect("run starts");

    // dask imports but trips over its pyarrow dependency.
    let response = agent
        .report_execution(&report("s2", 1, module_error_report("pyarrow")))
        .await
        .expect("report accepted");

    let install = dispatched_step(response.directive);
    let code = install.code().expect("install step has code");
    assert!(code.contains("pyarrow"), "{code}");
    assert!(!code.contains("dask"), "must not reinstall dask: {code}");

    // The original step's dask code was not rewritten.
    let install_ok = ok_report();
    let response = agent
        .report_execution(&report("s2", 1, install_ok))
        .await
        .expect("report accepted");
    let retried = dispatched_step(response.directive);
    assert!(retried.code().unwrap().contains("import dask.dataframe as dd"));
}

#[tokio::test]
async fn refine_without_reachable_llm_escalates() {
    let agent = service();
    agent
        .start_run(
            "s3",
            "describe the dataframe",
            NotebookContext::default(),
            dask_plan(),
        )
        .expect("run starts");

    let failure = ExecutionReport {
        status: ExecutionStatus::Error,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(ExecutionError {
            kind: "TypeError".into(),
            message: "unsupported operand type(s)".into(),
            traceback: vec![],
        }),
        new_variables: None,
        installed_packages: None,
    };

    let response = agent
        .report_execution(&report("s3", 1, failure))
        .await
        .expect("report accepted");

    assert_eq!(response.run_status, RunStatus::Escalated);
    match response.directive {
        Some(RunDirective::Escalated { reason }) => {
            assert!(reason.contains("LLM unavailable"), "{reason}");
        }
        other => panic!("expected Escalated, got {other:?}"),
    }

    // Further reports just restate the escalation.
    let response = agent
        .report_execution(&report("s3", 1, ok_report()))
        .await
        .expect("report accepted");
    assert_eq!(response.run_status, RunStatus::Escalated);
}

#[tokio::test]
async fn dlopen_failure_routes_to_replanning_path() {
    let agent = service();
    agent
        .start_run("s4", "train a model", NotebookContext::default(), dask_plan())
        .expect("run starts");

    let failure = ExecutionReport {
        status: ExecutionStatus::Error,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(ExecutionError {
            kind: "OSError".into(),
            message: "dlopen(/opt/lib/lib_lightgbm.dylib, 6): Library not loaded: @rpath/libomp.dylib"
                .into(),
            traceback: vec![],
        }),
        new_variables: None,
        installed_packages: None,
    };

    // System dependencies need a replan; without a reachable model the run
    // escalates rather than guessing.
    let response = agent
        .report_execution(&report("s4", 1, failure))
        .await
        .expect("report accepted");
    assert_eq!(response.run_status, RunStatus::Escalated);
}

#[tokio::test]
async fn wrong_step_number_is_rejected() {
    let agent = service();
    agent
        .start_run("s5", "anything", NotebookContext::default(), dask_plan())
        .expect("run starts");

    let err = agent
        .report_execution(&report("s5", 7, ok_report()))
        .await
        .expect_err("mismatched step report rejected");
    assert!(matches!(err, AgentServerError::InvalidInput(_)));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let agent = service();
    let err = agent
        .report_execution(&report("missing", 1, ok_report()))
        .await
        .expect_err("unknown session rejected");
    assert!(matches!(err, AgentServerError::NotFound(_)));
}

#[tokio::test]
async fn one_run_per_session_is_enforced() {
    let agent = service();
    agent
        .start_run("s6", "first", NotebookContext::default(), dask_plan())
        .expect("first run starts");

    let err = agent
        .start_run("s6", "second", NotebookContext::default(), dask_plan())
        .expect_err("second concurrent run rejected");
    assert!(matches!(err, AgentServerError::InvalidInput(_)));
}

#[tokio::test]
async fn invalid_plan_is_rejected_at_start() {
    let agent = service();
    let mut plan = dask_plan();
    plan.steps[1].tool_calls = vec![ToolCall::jupyter_cell("print('no final answer')")];

    let err = agent
        .start_run("s7", "anything", NotebookContext::default(), plan)
        .expect_err("plan without final answer rejected");
    assert!(matches!(err, AgentServerError::InvalidInput(_)));
}
