//! End-to-end execution through the orchestrator.
//!
//! Tests that need a toolchain return early when it is not installed.

use std::time::Duration;

use polybook_core::{
    AbortHandle, CellUpdate, Config, Error, ExecutionRequest, InputBroker, InterpreterSession,
    Language, Orchestrator, OutputItem, SessionConfig, SessionState, TransientRunner,
};
use polybook_core::execute::NullSink;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(30);

fn python() -> Option<String> {
    ["python3", "python"]
        .into_iter()
        .find(|p| which::which(p).is_ok())
        .map(str::to_string)
}

fn has(tool: &str) -> bool {
    which::which(tool).is_ok()
}

fn orchestrator(python: String) -> (Orchestrator, mpsc::UnboundedReceiver<CellUpdate>) {
    let config = Config {
        python,
        ..Config::default()
    };
    Orchestrator::new(config, InputBroker::new())
}

fn text_of(items: &[OutputItem]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            OutputItem::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Wait for the first update that shows an input prompt.
async fn next_prompt(updates: &mut mpsc::UnboundedReceiver<CellUpdate>) -> (String, String) {
    loop {
        let update = updates.recv().await.expect("update stream closed");
        for item in update.items {
            if let OutputItem::InputRequest(prompt) = item {
                return (prompt.request_id, prompt.prompt);
            }
        }
    }
}

#[tokio::test]
async fn test_stateless_print() {
    let Some(python) = python() else { return };
    let (orchestrator, _updates) = orchestrator(python.clone());

    let report = tokio::time::timeout(
        TIMEOUT,
        orchestrator.execute(ExecutionRequest::new("a", "python", "print(\"hi\")").stateless(true)),
    )
    .await
    .unwrap();
    assert_eq!(report.outcome.unwrap(), vec![OutputItem::Text("hi\n".to_string())]);
    assert_eq!(orchestrator.broker().pending_count(), 0);

    // The same through a session directly, to observe its disposal.
    let session = InterpreterSession::new(SessionConfig {
        program: python,
        startup_timeout: Duration::from_secs(10),
    });
    let result = tokio::time::timeout(
        TIMEOUT,
        session.execute("print(\"hi\")", std::sync::Arc::new(NullSink), &AbortHandle::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.displayed, "hi\n");
    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Disposed);
}

#[tokio::test]
async fn test_input_round_trip() {
    let Some(python) = python() else { return };
    let (orchestrator, mut updates) = orchestrator(python);

    let code = "name = input(\"Name: \")\nprint(f\"Hello, {name}!\")";
    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(ExecutionRequest::new("b", "python", code))
                .await
        })
    };

    let (request_id, prompt) = tokio::time::timeout(TIMEOUT, next_prompt(&mut updates))
        .await
        .unwrap();
    assert_eq!(prompt, "Name: ");
    assert_eq!(
        orchestrator.broker().resolve(Some(&request_id), "Ada"),
        Some(request_id.clone())
    );

    let report = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    let text = text_of(&report.outcome.unwrap());
    assert!(text.contains("Name: Ada\nHello, Ada!"), "got {text:?}");
    assert_eq!(orchestrator.broker().pending_count(), 0);
    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_compile_error_is_reported() {
    if !has("gcc") {
        return;
    }
    let runner = TransientRunner::new(Config::default());
    let err = runner
        .run(
            Language::C,
            "int main(void) { return 0 }",
            &NullSink,
            &AbortHandle::new(),
        )
        .await
        .unwrap_err();
    match err {
        Error::CompileFailure { language, diagnostics } => {
            assert_eq!(language, "c");
            assert!(diagnostics.contains("error"), "got {diagnostics:?}");
        }
        other => panic!("expected compile failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_java_compile_error_is_reported() {
    if !has("javac") || !has("java") {
        return;
    }
    let (orchestrator, _updates) = orchestrator(python().unwrap_or_else(|| "python3".into()));
    let report = tokio::time::timeout(
        TIMEOUT,
        orchestrator.execute(ExecutionRequest::new("j", "java", "int x = ;")),
    )
    .await
    .unwrap();
    assert!(matches!(report.outcome, Err(Error::CompileFailure { .. })));
}

#[tokio::test]
async fn test_state_is_shared_but_not_with_stateless_blocks() {
    let Some(python) = python() else { return };
    let (orchestrator, _updates) = orchestrator(python);

    let run = |id: &str, code: &str, stateless: bool| {
        let request = ExecutionRequest::new(id, "python", code).stateless(stateless);
        let orchestrator = orchestrator.clone();
        async move {
            tokio::time::timeout(TIMEOUT, orchestrator.execute(request))
                .await
                .unwrap()
        }
    };

    let first = run("d1", "answer = 41", false).await;
    assert!(first.outcome.is_ok());

    let second = run("d2", "print(answer + 1)", false).await;
    assert_eq!(text_of(&second.outcome.unwrap()), "42\n");
    assert!(second.execution_order > first.execution_order);

    let isolated = run("d3", "print(answer + 1)", true).await;
    let text = text_of(&isolated.outcome.unwrap());
    assert!(text.contains("NameError"), "got {text:?}");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_interrupt_then_fresh_session() {
    let Some(python) = python() else { return };
    let (orchestrator, _updates) = orchestrator(python);

    let setup = orchestrator
        .execute(ExecutionRequest::new("i1", "python", "kept = 1"))
        .await;
    assert!(setup.outcome.is_ok());

    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(ExecutionRequest::new(
                    "i2",
                    "python",
                    "import time\nprint('sleeping', flush=True)\ntime.sleep(60)",
                ))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.interrupt();

    let report = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(report.outcome, Err(Error::Interrupted)));

    let after = tokio::time::timeout(
        TIMEOUT,
        orchestrator.execute(ExecutionRequest::new("i3", "python", "print('kept' in globals())")),
    )
    .await
    .unwrap();
    assert_eq!(text_of(&after.outcome.unwrap()), "False\n");
    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_cancelled_request_reports_cancelled() {
    let Some(python) = python() else { return };
    let (orchestrator, _updates) = orchestrator(python);

    let abort = AbortHandle::new();
    let task = {
        let orchestrator = orchestrator.clone();
        let request = ExecutionRequest::new("x", "python", "import time\ntime.sleep(60)")
            .with_abort(abort.clone());
        tokio::spawn(async move { orchestrator.execute(request).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    abort.abort();

    let report = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    let err = report.outcome.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(err.is_stopped());
    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_pending_input_is_cancelled_on_dispose() {
    let Some(python) = python() else { return };
    let (orchestrator, mut updates) = orchestrator(python);

    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(ExecutionRequest::new("p", "python", "input('Waiting: ')"))
                .await
        })
    };
    let _ = tokio::time::timeout(TIMEOUT, next_prompt(&mut updates))
        .await
        .unwrap();
    assert_eq!(orchestrator.broker().pending_count(), 1);

    orchestrator.dispose().await;
    let report = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(report.outcome, Err(Error::SessionDisposed)));
    assert_eq!(orchestrator.broker().pending_count(), 0);
}
