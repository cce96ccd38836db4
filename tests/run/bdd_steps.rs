//! BDD step definitions for the `fly` run workflow.

use std::io::Read;

use flate2::read::GzDecoder;
use fly::test_support::SCRIPTED_BUILD_ID;
use fly::{
    BuildConfig, DEFAULT_BUILD_FILE, EventStreamConsumer, Interrupt, RunOrchestrator, RunRequest,
    exit_code,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use super::test_helpers::{RunContext, RunResult, RunTestError};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] RunTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a build directory with a build configuration")]
fn build_directory(run_context: RunContext) -> RunContext {
    run_context
}

#[given("the orchestrator streams the log \"{payload}\"")]
fn streams_log(run_context: RunContext, payload: String) -> RunContext {
    run_context.orchestrator.push_log(&payload);
    run_context
}

#[given("the orchestrator reports status \"{status}\"")]
fn reports_status(run_context: RunContext, status: String) -> RunContext {
    run_context.orchestrator.push_status(&status);
    run_context
}

#[given("the orchestrator reports status \"{status}\" once aborted")]
fn reports_status_once_aborted(run_context: RunContext, status: String) -> RunContext {
    run_context
        .orchestrator
        .on_abort_push_frame(status_frame(&status));
    run_context
}

#[given("the orchestrator reports status \"{status}\" once the upload finishes")]
fn reports_status_after_upload(run_context: RunContext, status: String) -> RunContext {
    run_context
        .orchestrator
        .on_upload_push_frame(status_frame(&status));
    run_context
}

#[given("the orchestrator hands out the affinity cookie \"{cookie}\"")]
fn hands_out_cookie(run_context: RunContext, cookie: String) -> RunContext {
    run_context.orchestrator.with_cookie(&cookie);
    run_context
}

#[given("the upload stays open until the build finishes")]
fn upload_stays_open(run_context: RunContext) -> RunContext {
    run_context.orchestrator.hold_upload();
    run_context
}

#[given("the upload fails")]
fn upload_fails(run_context: RunContext) -> RunContext {
    run_context.orchestrator.fail_on_upload();
    run_context
}

#[given("the orchestrator rejects the build")]
fn rejects_build(run_context: RunContext) -> RunContext {
    run_context.orchestrator.fail_on_submit();
    run_context
}

#[given("the event stream drops")]
fn event_stream_drops(run_context: RunContext) -> RunContext {
    run_context.orchestrator.push_disconnect();
    run_context
}

#[given("the environment sets parameter \"{name}\" to \"{value}\"")]
fn environment_sets_param(mut run_context: RunContext, name: String, value: String) -> RunContext {
    run_context.overrides.insert(name, value);
    run_context
}

#[given("the environment clears parameter \"{name}\"")]
fn environment_clears_param(mut run_context: RunContext, name: String) -> RunContext {
    run_context.overrides.insert(name, String::new());
    run_context
}

/// When the scenario delivers an interruption relative to the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Signal {
    Never,
    BeforeSubmission,
    AfterUploadStarts,
}

#[when("I submit the build")]
fn submit_build(run_context: RunContext) -> Result<RunContext, StepError> {
    execute(run_context, Signal::Never)
}

#[when("I submit the build with extra arguments \"{args}\"")]
fn submit_build_with_args(
    mut run_context: RunContext,
    args: String,
) -> Result<RunContext, StepError> {
    run_context.args = args.split_whitespace().map(str::to_owned).collect();
    execute(run_context, Signal::Never)
}

#[when("I interrupt the build after the upload starts")]
fn interrupt_build(run_context: RunContext) -> Result<RunContext, StepError> {
    execute(run_context, Signal::AfterUploadStarts)
}

#[when("I interrupt the build before it is submitted")]
fn interrupt_before_submission(run_context: RunContext) -> Result<RunContext, StepError> {
    execute(run_context, Signal::BeforeSubmission)
}

fn execute(run_context: RunContext, signal: Signal) -> Result<RunContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let mut config = BuildConfig::load(&run_context.dir.join(DEFAULT_BUILD_FILE))
        .map_err(|err| StepError::Assertion(format!("load build config: {err}")))?;
    config.apply_env_overrides(|name| run_context.overrides.get(name).cloned());
    config.append_args(run_context.args.clone());
    let request = RunRequest {
        dir: run_context.dir.clone(),
        config,
        privileged: true,
    };

    let run = RunOrchestrator::new(run_context.orchestrator.clone());
    let mut consumer = EventStreamConsumer::new(Vec::new(), Vec::new());
    let (tx, rx) = oneshot::channel();
    let notifier = run_context.orchestrator.clone();
    let result = runtime.block_on(async {
        let trigger = async move {
            match signal {
                Signal::Never => {}
                Signal::BeforeSubmission => {
                    tx.send(Interrupt::Interrupt).ok();
                }
                Signal::AfterUploadStarts => {
                    notifier.upload_started().await;
                    tx.send(Interrupt::Interrupt).ok();
                }
            }
        };
        let (result, ()) = tokio::join!(run.execute(&request, &mut consumer, rx), trigger);
        result
    });

    let (stdout, stderr) = consumer.into_inner();
    let (code, error) = match result {
        Ok(outcome) => (outcome.exit_code(), None),
        Err(err) => (exit_code::CLIENT_FAULT, Some(err.to_string())),
    };

    Ok(RunContext {
        outcome: Some(RunResult {
            exit_code: code,
            error,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        ..run_context
    })
}

fn status_frame(status: &str) -> String {
    serde_json::json!({"type": "status", "event": {"status": status}}).to_string()
}

fn outcome(run_context: &RunContext) -> Result<&RunResult, StepError> {
    run_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the exit code is \"{code}\"")]
fn exit_code_is(run_context: &RunContext, code: i32) -> Result<(), StepError> {
    let result = outcome(run_context)?;
    if result.exit_code == code {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected exit code {code}, got {} (error: {:?}, stderr: {})",
            result.exit_code, result.error, result.stderr
        )))
    }
}

#[then("stdout contains \"{text}\"")]
fn stdout_contains(run_context: &RunContext, text: String) -> Result<(), StepError> {
    let result = outcome(run_context)?;
    if result.stdout.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected stdout to contain '{text}', got: {}",
            result.stdout
        )))
    }
}

#[then("the run fails with a client fault mentioning \"{text}\"")]
fn client_fault(run_context: &RunContext, text: String) -> Result<(), StepError> {
    let result = outcome(run_context)?;
    match &result.error {
        Some(message)
            if message.contains(&text) && result.exit_code == exit_code::CLIENT_FAULT =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected client fault mentioning '{text}', got {other:?} with exit code {}",
            result.exit_code
        ))),
    }
}

#[then("no abort was requested")]
fn no_abort(run_context: &RunContext) -> Result<(), StepError> {
    let aborts = run_context.orchestrator.abort_requests();
    if aborts.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no abort, got {aborts:?}"
        )))
    }
}

#[then("exactly one abort request carried the cookie \"{cookie}\"")]
fn one_abort_with_cookie(run_context: &RunContext, cookie: String) -> Result<(), StepError> {
    let aborts = run_context.orchestrator.abort_requests();
    match aborts.as_slice() {
        [(SCRIPTED_BUILD_ID, Some(presented))] if *presented == cookie => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one abort for build {SCRIPTED_BUILD_ID} with cookie '{cookie}', got {other:?}"
        ))),
    }
}

#[then("the uploaded archive contains \"{entry}\"")]
fn archive_contains(run_context: &RunContext, entry: String) -> Result<(), StepError> {
    let uploads = run_context.orchestrator.uploaded();
    let [bytes] = uploads.as_slice() else {
        return Err(StepError::Assertion(format!(
            "expected one upload, got {}",
            uploads.len()
        )));
    };
    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    let entries = archive
        .entries()
        .map_err(|err| StepError::Assertion(format!("read archive: {err}")))?;
    let mut names = Vec::new();
    for item in entries {
        let mut file = item.map_err(|err| StepError::Assertion(format!("read entry: {err}")))?;
        let name = file
            .path()
            .map_err(|err| StepError::Assertion(format!("entry path: {err}")))?
            .to_string_lossy()
            .into_owned();
        let mut sink = Vec::new();
        file.read_to_end(&mut sink)
            .map_err(|err| StepError::Assertion(format!("entry body: {err}")))?;
        names.push(name);
    }
    if names.iter().any(|name| name.trim_start_matches("./") == entry) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected archive to contain '{entry}', got {names:?}"
        )))
    }
}

#[then("nothing was submitted")]
fn nothing_submitted(run_context: &RunContext) -> Result<(), StepError> {
    let submitted = run_context.orchestrator.submitted();
    if submitted.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no submission, got {} build(s)",
            submitted.len()
        )))
    }
}

#[then("nothing was uploaded")]
fn nothing_uploaded(run_context: &RunContext) -> Result<(), StepError> {
    let uploads = run_context.orchestrator.uploaded();
    if uploads.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no upload, got {} upload(s)",
            uploads.len()
        )))
    }
}

#[then("the submitted run arguments are \"{args}\"")]
fn submitted_args(run_context: &RunContext, args: String) -> Result<(), StepError> {
    let expected: Vec<&str> = args.split_whitespace().collect();
    let submitted = run_context.orchestrator.submitted();
    let spec = submitted
        .first()
        .ok_or_else(|| StepError::Assertion(String::from("no build submitted")))?;
    if spec.config.run.args == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected run arguments {expected:?}, got {:?}",
            spec.config.run.args
        )))
    }
}

#[then("the submitted parameter \"{name}\" is \"{value}\"")]
fn submitted_param(run_context: &RunContext, name: String, value: String) -> Result<(), StepError> {
    assert_param(run_context, &name, &value)
}

#[then("the submitted parameter \"{name}\" is empty")]
fn submitted_param_empty(run_context: &RunContext, name: String) -> Result<(), StepError> {
    assert_param(run_context, &name, "")
}

fn assert_param(run_context: &RunContext, name: &str, value: &str) -> Result<(), StepError> {
    let submitted = run_context.orchestrator.submitted();
    let spec = submitted
        .first()
        .ok_or_else(|| StepError::Assertion(String::from("no build submitted")))?;
    match spec.config.params.get(name) {
        Some(actual) if actual == value => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected parameter {name}='{value}', got {other:?}"
        ))),
    }
}
