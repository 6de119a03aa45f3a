//! Persistent Python interpreter sessions.
//!
//! An [`InterpreterSession`] owns one long-lived `python -u -i` process and
//! a FIFO queue of submissions. A single worker task consumes the queue, so
//! at most one submission is ever in flight against the process.
//!
//! ```text
//! execute() ──► jobs (mpsc) ──► worker ──► stdin: __polybook_run__(b64, marker)
//!                                  ▲
//! interrupt() / dispose() ──► control (mpsc)
//!
//! stdout ──► reader task ──► StreamDemux ──► events (mpsc) ──► worker ──► sink
//! ```
//!
//! Interrupting kills the process; the next submission transparently starts
//! a fresh one. Disposal is terminal: queued and future submissions fail
//! with [`Error::SessionDisposed`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};

use super::bootstrap;
use super::context::{AbortHandle, ExecutionResult, ExecutionSink};
use super::kill;
use super::transient::CANCELLED_INPUT;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::markers::{CompletionMarker, READY};
use crate::stream::{StreamDemux, StreamEvent, Utf8Decoder};

const READ_CHUNK: usize = 8192;
const STDERR_TAIL: usize = 2048;

/// Lifecycle of an interpreter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No interpreter process is running.
    Uninitialized,
    /// The process was spawned and the preamble sent; waiting for readiness.
    Starting,
    /// Idle and ready for a submission.
    Ready,
    /// A submission is in flight.
    Busy,
    /// Terminal. Every submission is rejected.
    Disposed,
}

/// How to launch the interpreter.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub program: String,
    pub startup_timeout: Duration,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            program: config.python.clone(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

struct Job {
    source: String,
    sink: Arc<dyn ExecutionSink>,
    abort: AbortHandle,
    reply: oneshot::Sender<Result<ExecutionResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Interrupt,
    Dispose,
}

/// Handle to a persistent interpreter session.
///
/// Dropping the handle disposes the session.
pub struct InterpreterSession {
    jobs: mpsc::UnboundedSender<Job>,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<SessionState>,
}

impl InterpreterSession {
    /// Create a session. The interpreter is not spawned until the first
    /// submission. Must be called within a tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);

        let worker = Worker {
            config,
            jobs: jobs_rx,
            control: control_rx,
            state: state_tx,
            process: None,
        };
        tokio::spawn(worker.run());

        Self {
            jobs: jobs_tx,
            control: control_tx,
            state: state_rx,
        }
    }

    /// Submit `source` and wait for its result.
    ///
    /// Submissions run strictly in the order they were made. Triggering
    /// `abort` returns [`Error::Cancelled`] at once: a queued submission is
    /// skipped when the worker reaches it, a running one kills the
    /// interpreter.
    pub async fn execute(
        &self,
        source: impl Into<String>,
        sink: Arc<dyn ExecutionSink>,
        abort: &AbortHandle,
    ) -> Result<ExecutionResult> {
        let (reply, result) = oneshot::channel();
        let job = Job {
            source: source.into(),
            sink,
            abort: abort.clone(),
            reply,
        };
        self.jobs.send(job).map_err(|_| Error::SessionDisposed)?;
        tokio::select! {
            biased;
            result = result => result.unwrap_or(Err(Error::SessionDisposed)),
            _ = abort.aborted() => Err(Error::Cancelled),
        }
    }

    /// Kill the interpreter. An in-flight submission fails with
    /// [`Error::Interrupted`]; interpreter state is lost.
    pub fn interrupt(&self) {
        let _ = self.control.send(Control::Interrupt);
    }

    /// Dispose the session without waiting for teardown.
    pub fn dispose(&self) {
        let _ = self.control.send(Control::Dispose);
    }

    /// Dispose the session and wait until the interpreter has been reaped.
    pub async fn shutdown(&self) {
        self.dispose();
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Disposed).await;
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for InterpreterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterSession")
            .field("state", &self.state())
            .finish()
    }
}

/// What ended a submission.
enum Outcome {
    Completed(ExecutionResult),
    Cancelled,
    Interrupted,
    Disposed,
    Exited(Option<String>),
}

/// The single consumer of a session's queue.
struct Worker {
    config: SessionConfig,
    jobs: mpsc::UnboundedReceiver<Job>,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<SessionState>,
    process: Option<Interpreter>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let job = tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Interrupt) => {
                        self.stop_process().await;
                        continue;
                    }
                    Some(Control::Dispose) | None => break,
                },
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            if job.reply.is_closed() {
                tracing::debug!("submission abandoned before it started");
                continue;
            }
            if job.abort.is_aborted() {
                let _ = job.reply.send(Err(Error::Cancelled));
                continue;
            }

            if let Some(process) = self.process.as_mut()
                && process.has_exited()
            {
                tracing::info!("interpreter exited between submissions, restarting");
                self.process = None;
            }

            if self.process.is_none() {
                self.state.send_replace(SessionState::Starting);
                let started = tokio::select! {
                    biased;
                    control = self.control.recv() => match stopped(control) {
                        Outcome::Interrupted => Err(Error::Interrupted),
                        _ => Err(Error::SessionDisposed),
                    },
                    _ = job.abort.aborted() => Err(Error::Cancelled),
                    started = Interpreter::start(&self.config) => started,
                };
                match started {
                    Ok(process) => self.process = Some(process),
                    Err(Error::SessionDisposed) => {
                        let _ = job.reply.send(Err(Error::SessionDisposed));
                        break;
                    }
                    Err(e) => {
                        if !e.is_stopped() {
                            tracing::warn!("interpreter failed to start: {}", e);
                        }
                        self.state.send_replace(SessionState::Uninitialized);
                        let _ = job.reply.send(Err(e));
                        continue;
                    }
                }
            }

            let Some(process) = self.process.as_mut() else {
                continue;
            };
            self.state.send_replace(SessionState::Busy);
            let outcome = process
                .submit(&job.source, job.sink.as_ref(), &job.abort, &mut self.control)
                .await;

            match outcome {
                Outcome::Completed(result) => {
                    self.state.send_replace(SessionState::Ready);
                    let _ = job.reply.send(Ok(result));
                }
                Outcome::Cancelled => {
                    tracing::info!("submission cancelled, killing interpreter");
                    self.stop_process().await;
                    let _ = job.reply.send(Err(Error::Cancelled));
                }
                Outcome::Interrupted => {
                    tracing::info!("interrupting interpreter");
                    self.stop_process().await;
                    let _ = job.reply.send(Err(Error::Interrupted));
                }
                Outcome::Exited(status) => {
                    tracing::warn!(?status, "interpreter exited during submission");
                    self.stop_process().await;
                    let _ = job.reply.send(Err(Error::InterpreterExited { status }));
                }
                Outcome::Disposed => {
                    let _ = job.reply.send(Err(Error::SessionDisposed));
                    break;
                }
            }
        }

        self.stop_process().await;
        self.state.send_replace(SessionState::Disposed);
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.reply.send(Err(Error::SessionDisposed));
        }
        tracing::debug!("interpreter session disposed");
    }

    async fn stop_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            kill::terminate(&mut process.child).await;
        }
        self.state.send_replace(SessionState::Uninitialized);
    }
}

/// One running interpreter process.
struct Interpreter {
    child: Child,
    stdin: ChildStdin,
    demux: Arc<Mutex<StreamDemux>>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    stderr_tail: Arc<Mutex<String>>,
}

impl Interpreter {
    /// Spawn the interpreter, install the preamble and wait for readiness.
    async fn start(config: &SessionConfig) -> Result<Self> {
        let mut cmd = kill::piped_command(&config.program);
        cmd.args(["-u", "-i"]).env("PYTHONIOENCODING", "utf-8");
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: config.program.clone(),
            source,
        })?;
        tracing::info!(program = %config.program, pid = ?child.id(), "spawned interpreter");

        let piped = || std::io::Error::other("interpreter stdio was not piped");
        let stdin = child.stdin.take().ok_or_else(piped)?;
        let stdout = child.stdout.take().ok_or_else(piped)?;
        let stderr = child.stderr.take().ok_or_else(piped)?;

        let demux = Arc::new(Mutex::new(StreamDemux::with_start_marker(READY)));
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(read_stdout(stdout, demux.clone(), events_tx));
        tokio::spawn(read_stderr(stderr, stderr_tail.clone()));

        let mut interpreter = Self {
            child,
            stdin,
            demux,
            events,
            stderr_tail,
        };

        let handshake =
            tokio::time::timeout(config.startup_timeout, interpreter.handshake()).await;
        match handshake {
            Ok(Ok(())) => {
                tracing::debug!("interpreter ready");
                Ok(interpreter)
            }
            Ok(Err(e)) => {
                kill::terminate(&mut interpreter.child).await;
                Err(e)
            }
            Err(_) => {
                kill::terminate(&mut interpreter.child).await;
                Err(Error::StartupTimeout {
                    program: config.program.clone(),
                    timeout: config.startup_timeout,
                })
            }
        }
    }

    /// Install the preamble and wait for its readiness marker.
    async fn handshake(&mut self) -> Result<()> {
        self.write(&bootstrap::install_line()).await?;
        while let Some(event) = self.events.recv().await {
            if event == StreamEvent::Started {
                return Ok(());
            }
        }
        Err(Error::InterpreterExited {
            status: self.exit_detail().await,
        })
    }

    /// Run one submission until its completion marker, a stop request, or
    /// the process going away.
    async fn submit(
        &mut self,
        source: &str,
        sink: &dyn ExecutionSink,
        abort: &AbortHandle,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Outcome {
        let marker = CompletionMarker::generate();
        self.arm(marker.clone());
        tracing::debug!(%marker, "submitting");
        if let Err(e) = self.write(&bootstrap::run_line(source, &marker)).await {
            tracing::debug!("failed to submit: {}", e);
            return Outcome::Exited(self.exit_detail().await);
        }

        loop {
            let event = tokio::select! {
                biased;
                control = control.recv() => return stopped(control),
                _ = abort.aborted() => return Outcome::Cancelled,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => return Outcome::Exited(self.exit_detail().await),
                },
            };

            match event {
                StreamEvent::Display(text) => sink.on_display(&text).await,
                StreamEvent::InputRequest { request_id, prompt } => {
                    let answer = tokio::select! {
                        biased;
                        control = control.recv() => return stopped(control),
                        _ = abort.aborted() => return Outcome::Cancelled,
                        answer = sink.on_input_request(request_id, prompt.clone()) => answer,
                    };
                    let (line, echo) = match answer {
                        Some(value) => (format!("{value}\n"), format!("{prompt}{value}\n")),
                        None => ("\n".to_string(), format!("{prompt}{CANCELLED_INPUT}\n")),
                    };
                    let echoed = self.lock_demux().annotate(&echo);
                    if let StreamEvent::Display(text) = echoed {
                        sink.on_display(&text).await;
                    }
                    if let Err(e) = self.write(&line).await {
                        tracing::debug!("failed to deliver input: {}", e);
                        return Outcome::Exited(self.exit_detail().await);
                    }
                }
                StreamEvent::Completed(result) => return Outcome::Completed(result),
                StreamEvent::Started => {}
            }
        }
    }

    /// Bind the demultiplexer to `marker` and drop events from before it.
    fn arm(&mut self, marker: CompletionMarker) {
        // The reader sends while holding the lock, so every event queued
        // now predates the new marker.
        let mut demux = self.demux.lock().unwrap_or_else(PoisonError::into_inner);
        demux.arm(marker);
        while let Ok(stale) = self.events.try_recv() {
            tracing::trace!(?stale, "discarding event from before submission");
        }
    }

    fn lock_demux(&self) -> std::sync::MutexGuard<'_, StreamDemux> {
        self.demux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&mut self, text: &str) -> Result<()> {
        self.stdin.write_all(text.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status and any stderr output, for error reports.
    async fn exit_detail(&mut self) -> Option<String> {
        let status = tokio::time::timeout(Duration::from_millis(500), self.child.wait())
            .await
            .ok()
            .and_then(|status| status.ok())
            .map(|status| status.to_string());
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trim()
            .to_string();
        match (status, tail.is_empty()) {
            (Some(status), true) => Some(status),
            (Some(status), false) => Some(format!("{status}: {tail}")),
            (None, false) => Some(tail),
            (None, true) => None,
        }
    }
}

fn stopped(control: Option<Control>) -> Outcome {
    match control {
        Some(Control::Interrupt) => Outcome::Interrupted,
        Some(Control::Dispose) | None => Outcome::Disposed,
    }
}

async fn read_stdout(
    mut stdout: impl AsyncRead + Unpin,
    demux: Arc<Mutex<StreamDemux>>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let text = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => decoder.decode(&buf[..n]),
            Err(e) => {
                tracing::debug!("interpreter stdout read failed: {}", e);
                break;
            }
        };
        let mut guard = demux.lock().unwrap_or_else(PoisonError::into_inner);
        for event in guard.push(&text) {
            if events.send(event).is_err() {
                return;
            }
        }
    }

    let mut guard = demux.lock().unwrap_or_else(PoisonError::into_inner);
    for event in guard.push(&decoder.flush()) {
        let _ = events.send(event);
    }
    tracing::debug!("interpreter stdout closed");
}

/// Stderr only carries interpreter noise (banner, prompts, fatal errors);
/// user code writes its errors to stdout once the preamble has run.
async fn read_stderr(mut stderr: impl AsyncRead + Unpin, tail: Arc<Mutex<String>>) {
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    while let Ok(n) = stderr.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let text = decoder.decode(&buf[..n]);
        tracing::debug!(stderr = %text.trim_end(), "interpreter stderr");

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.push_str(&text);
        if tail.len() > STDERR_TAIL {
            let mut cut = tail.len() - STDERR_TAIL;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
}
