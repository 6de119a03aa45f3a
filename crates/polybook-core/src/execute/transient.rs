//! One-shot execution of compiled and scripted languages.
//!
//! Each run gets its own scratch directory. The source (with the input
//! helper injected) is written there, compiled if the language needs it,
//! and executed with stdio piped through a [`StreamDemux`]. The scratch
//! directory is removed on every exit path.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;

use super::context::{AbortHandle, CleanupScope, ExecutionResult, ExecutionSink};
use super::kill;
use super::scratch::ScratchDir;
use super::source::{self, PreparedSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::language::Language;
use crate::stream::{StreamDemux, StreamEvent, Utf8Decoder};

const READ_CHUNK: usize = 8192;

/// Text shown in place of an answer when an input request was cancelled.
pub const CANCELLED_INPUT: &str = "<cancelled>";

/// A program invocation: executable plus arguments.
#[derive(Debug, Clone)]
struct Invocation {
    program: String,
    args: Vec<OsString>,
}

impl Invocation {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Runs one code block to completion in a fresh subprocess.
#[derive(Debug, Clone)]
pub struct TransientRunner {
    config: Config,
}

impl TransientRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run `source` once.
    ///
    /// Display text and input requests are reported through `sink` as they
    /// occur. Triggering `abort` kills the subprocess and yields
    /// [`Error::Cancelled`].
    pub async fn run(
        &self,
        language: Language,
        source: &str,
        sink: &dyn ExecutionSink,
        abort: &AbortHandle,
    ) -> Result<ExecutionResult> {
        if abort.is_aborted() {
            return Err(Error::Cancelled);
        }

        let scratch = ScratchDir::new()?;
        let dir = scratch.path().to_path_buf();
        let prepared = source::prepare(language, source);
        let source_path = scratch.write(&prepared.file_name, &prepared.contents)?;
        let mut cleanup = CleanupScope::new();
        cleanup.on_cleanup(move || scratch.close());

        let (compile, run) = self.plan(language, &dir, &source_path, &prepared);
        if let Some(compile) = compile {
            tracing::debug!(%language, program = %compile.program, "compiling");
            compile_step(language, &compile, &dir, abort).await?;
        }

        tracing::debug!(%language, program = %run.program, "running");
        let result = run_step(&run, &dir, sink, abort).await;
        cleanup.run();
        result
    }

    /// Compile and run invocations for a prepared source in `dir`.
    fn plan(
        &self,
        language: Language,
        dir: &Path,
        source_path: &Path,
        prepared: &PreparedSource,
    ) -> (Option<Invocation>, Invocation) {
        let binary = dir.join(if cfg!(windows) { "main.exe" } else { "main" });

        let compile = self.config.compiler(language).map(|compiler| match language {
            Language::Java => Invocation::new(compiler).arg("-d").arg(dir).arg(source_path),
            _ => Invocation::new(compiler)
                .arg(source_path)
                .arg("-o")
                .arg(&binary),
        });
        let run = match language {
            Language::C | Language::Cpp => Invocation::new(&binary.to_string_lossy()),
            Language::Java => {
                let class = prepared.entry_class.as_deref().unwrap_or("Main");
                Invocation::new(&self.config.java)
                    .arg("-cp")
                    .arg(dir)
                    .arg(class)
            }
            Language::JavaScript => Invocation::new(&self.config.node).arg(source_path),
            Language::Python => Invocation::new(&self.config.python)
                .arg("-u")
                .arg(source_path),
        };
        (compile, run)
    }
}

async fn compile_step(
    language: Language,
    compile: &Invocation,
    dir: &Path,
    abort: &AbortHandle,
) -> Result<()> {
    let mut cmd = kill::piped_command(&compile.program);
    cmd.args(&compile.args).current_dir(dir).stdin(Stdio::null());
    let child = cmd.spawn().map_err(|source| Error::Spawn {
        program: compile.program.clone(),
        source,
    })?;

    // Dropping the wait future on abort drops the child, which kills it.
    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = abort.aborted() => return Err(Error::Cancelled),
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let diagnostics = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    tracing::debug!(%language, status = %output.status, "compilation failed");
    Err(Error::CompileFailure {
        language: language.to_string(),
        diagnostics,
    })
}

async fn run_step(
    run: &Invocation,
    dir: &Path,
    sink: &dyn ExecutionSink,
    abort: &AbortHandle,
) -> Result<ExecutionResult> {
    let mut cmd = kill::piped_command(&run.program);
    cmd.args(&run.args).current_dir(dir);
    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        program: run.program.clone(),
        source,
    })?;

    let piped = || std::io::Error::other("child stdio was not piped");
    let mut stdin = child.stdin.take().ok_or_else(piped)?;
    let mut stdout = child.stdout.take().ok_or_else(piped)?;
    let mut stderr = child.stderr.take().ok_or_else(piped)?;

    let mut demux = StreamDemux::new();
    let mut out_decoder = Utf8Decoder::new();
    let mut err_decoder = Utf8Decoder::new();
    let mut stderr_text = String::new();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let events = tokio::select! {
            biased;
            _ = abort.aborted() => {
                kill::terminate(&mut child).await;
                return Err(Error::Cancelled);
            }
            n = stdout.read(&mut out_buf), if out_open => match n? {
                0 => {
                    out_open = false;
                    demux.push(&out_decoder.flush())
                }
                n => demux.push(&out_decoder.decode(&out_buf[..n])),
            },
            n = stderr.read(&mut err_buf), if err_open => {
                let text = match n? {
                    0 => {
                        err_open = false;
                        err_decoder.flush()
                    }
                    n => err_decoder.decode(&err_buf[..n]),
                };
                stderr_text.push_str(&text);
                demux.push_stderr(&text).into_iter().collect()
            }
        };

        for event in events {
            match event {
                StreamEvent::Display(text) => sink.on_display(&text).await,
                StreamEvent::InputRequest { request_id, prompt } => {
                    let answer = tokio::select! {
                        biased;
                        _ = abort.aborted() => {
                            kill::terminate(&mut child).await;
                            return Err(Error::Cancelled);
                        }
                        answer = sink.on_input_request(request_id, prompt.clone()) => answer,
                    };
                    answer_input(&mut stdin, &mut demux, sink, &prompt, answer).await;
                }
                StreamEvent::Started | StreamEvent::Completed(_) => {}
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = abort.aborted() => {
            kill::terminate(&mut child).await;
            return Err(Error::Cancelled);
        }
    };
    if abort.is_aborted() {
        return Err(Error::Cancelled);
    }

    let (tail, result) = demux.finish();
    if let Some(StreamEvent::Display(text)) = tail {
        sink.on_display(&text).await;
    }

    if status.success() {
        return Ok(result);
    }

    let detail = [stderr_text.as_str(), &result.displayed, &result.raw]
        .into_iter()
        .find(|text| !text.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("process exited with {status}"));
    Err(Error::RuntimeFailure { detail })
}

/// Deliver an input answer to the child and echo it into the display.
async fn answer_input(
    stdin: &mut ChildStdin,
    demux: &mut StreamDemux,
    sink: &dyn ExecutionSink,
    prompt: &str,
    answer: Option<String>,
) {
    let (line, echo) = match answer {
        Some(value) => (format!("{value}\n"), format!("{prompt}{value}\n")),
        None => ("\n".to_string(), format!("{prompt}{CANCELLED_INPUT}\n")),
    };

    if let StreamEvent::Display(text) = demux.annotate(&echo) {
        sink.on_display(&text).await;
    }

    let written = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    };
    if let Err(e) = written.await {
        // The program exited without reading its input.
        tracing::debug!("failed to deliver input: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sink that records display text and answers inputs from a script.
    #[derive(Default)]
    struct ScriptedSink {
        display: Mutex<String>,
        prompts: Mutex<Vec<String>>,
        answers: Mutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn answering(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().rev().map(|s| s.to_string()).collect()),
                ..Default::default()
            }
        }
    }

    impl ExecutionSink for ScriptedSink {
        fn on_display<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()> {
            self.display.lock().unwrap().push_str(text);
            Box::pin(async {})
        }

        fn on_input_request(
            &self,
            _request_id: String,
            prompt: String,
        ) -> BoxFuture<'_, Option<String>> {
            self.prompts.lock().unwrap().push(prompt);
            let answer = self.answers.lock().unwrap().pop();
            Box::pin(async move { answer })
        }
    }

    fn python_runner() -> Option<TransientRunner> {
        let python = ["python3", "python"]
            .into_iter()
            .find(|p| which::which(p).is_ok())?;
        Some(TransientRunner::new(Config {
            python: python.to_string(),
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn test_stdout_and_input_round_trip() {
        let Some(runner) = python_runner() else {
            return;
        };
        let code = r#"
import sys
print("before")
sys.stdout.write("__POLYBOOK_INPUT_START__Name: __POLYBOOK_INPUT_END__")
sys.stdout.flush()
name = sys.stdin.readline().rstrip("\n")
print("Hello, " + name)
"#;
        let sink = ScriptedSink::answering(&["Ada"]);
        let result = runner
            .run(Language::Python, code, &sink, &AbortHandle::new())
            .await
            .expect("run should succeed");

        assert_eq!(result.displayed, "before\nName: Ada\nHello, Ada\n");
        assert_eq!(*sink.prompts.lock().unwrap(), vec!["Name: ".to_string()]);
        assert_eq!(*sink.display.lock().unwrap(), result.displayed);
        assert!(!result.raw.contains("Name: Ada"));
    }

    #[tokio::test]
    async fn test_cancelled_input_sends_empty_line() {
        let Some(runner) = python_runner() else {
            return;
        };
        let code = r#"
import sys
sys.stdout.write("__POLYBOOK_INPUT_START__Q? __POLYBOOK_INPUT_END__")
sys.stdout.flush()
print(repr(sys.stdin.readline()))
"#;
        let sink = ScriptedSink::answering(&[]);
        let result = runner
            .run(Language::Python, code, &sink, &AbortHandle::new())
            .await
            .unwrap();
        assert_eq!(result.displayed, "Q? <cancelled>\n'\\n'\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_prefers_stderr() {
        let Some(runner) = python_runner() else {
            return;
        };
        let code = "import sys\nprint('partial')\nsys.stderr.write('bad thing\\n')\nsys.exit(3)\n";
        let err = runner
            .run(Language::Python, code, &ScriptedSink::default(), &AbortHandle::new())
            .await
            .unwrap_err();
        match err {
            Error::RuntimeFailure { detail } => assert_eq!(detail, "bad thing\n"),
            other => panic!("expected runtime failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_falls_back_to_display() {
        let Some(runner) = python_runner() else {
            return;
        };
        let code = "import sys\nprint('only stdout')\nsys.exit(1)\n";
        let err = runner
            .run(Language::Python, code, &ScriptedSink::default(), &AbortHandle::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "only stdout\n");
    }

    #[tokio::test]
    async fn test_abort_kills_running_program() {
        let Some(runner) = python_runner() else {
            return;
        };
        let abort = AbortHandle::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.abort();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(
                Language::Python,
                "import time\ntime.sleep(60)\n",
                &ScriptedSink::default(),
                &abort,
            ),
        )
        .await
        .expect("abort should stop the program")
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = TransientRunner::new(Config {
            node: "polybook-no-such-node".to_string(),
            ..Config::default()
        });
        let err = runner
            .run(
                Language::JavaScript,
                "console.log(1)",
                &ScriptedSink::default(),
                &AbortHandle::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { program, .. } if program == "polybook-no-such-node"));
    }

    #[cfg(unix)]
    #[test]
    fn test_plan_uses_configured_compilers() {
        let runner = TransientRunner::new(Config {
            gcc: "/opt/gcc/bin/gcc".to_string(),
            javac: "/opt/jdk/bin/javac".to_string(),
            ..Config::default()
        });
        let dir = Path::new("/tmp/polybook-plan");

        let prepared = source::prepare(Language::C, "int main(void) { return 0; }");
        let source_path = dir.join(&prepared.file_name);
        let (compile, run) = runner.plan(Language::C, dir, &source_path, &prepared);
        let compile = compile.expect("C has a compile step");
        assert_eq!(compile.program, "/opt/gcc/bin/gcc");
        assert_eq!(compile.args[0].as_os_str(), source_path.as_os_str());
        assert_eq!(run.program, dir.join("main").to_string_lossy().into_owned());

        let prepared = source::prepare(Language::Java, "System.out.println(1);");
        let source_path = dir.join(&prepared.file_name);
        let (compile, run) = runner.plan(Language::Java, dir, &source_path, &prepared);
        assert_eq!(compile.expect("Java has a compile step").program, "/opt/jdk/bin/javac");
        assert_eq!(run.args.last().map(|a| a.as_os_str()), Some(std::ffi::OsStr::new("Main")));

        let prepared = source::prepare(Language::JavaScript, "console.log(1)");
        let source_path = dir.join(&prepared.file_name);
        let (compile, _) = runner.plan(Language::JavaScript, dir, &source_path, &prepared);
        assert!(compile.is_none());
    }
}
