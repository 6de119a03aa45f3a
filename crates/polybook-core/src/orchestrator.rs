//! Per-block execution driver.
//!
//! The [`Orchestrator`] picks a runner for each block, numbers executions,
//! wires cancellation and turns runner progress into [`CellUpdate`]s. Every
//! update replaces the block's whole output; updates for one block are
//! produced under a single lock so concurrent display text and input
//! prompts never interleave into an inconsistent view.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::broker::InputBroker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::execute::{
    AbortHandle, ExecutionSink, InterpreterSession, SessionConfig, TransientRunner,
};
use crate::language::{Language, Strategy};
use crate::output::{self, CellId, CellUpdate, InputPrompt, OutputItem, OutputView, READONLY_NOTICE};
use crate::protocol::ServerMessage;

/// One code block to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub cell_id: CellId,
    pub language: String,
    pub source: String,
    /// Run in a throwaway interpreter instead of the shared one.
    pub stateless: bool,
    /// Skip execution and report a fixed notice.
    pub readonly: bool,
    pub abort: AbortHandle,
}

impl ExecutionRequest {
    pub fn new(
        cell_id: impl Into<CellId>,
        language: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            cell_id: cell_id.into(),
            language: language.into(),
            source: source.into(),
            stateless: false,
            readonly: false,
            abort: AbortHandle::new(),
        }
    }

    pub fn stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }
}

/// Terminal report of one execution.
#[derive(Debug)]
pub struct CellReport {
    pub cell_id: CellId,
    pub execution_order: u64,
    pub outcome: Result<Vec<OutputItem>>,
}

impl CellReport {
    pub fn to_message(&self) -> ServerMessage {
        match &self.outcome {
            Ok(outputs) => ServerMessage::CellCompleted {
                cell_id: self.cell_id.clone(),
                execution_order: self.execution_order,
                outputs: outputs.clone(),
            },
            Err(e) => ServerMessage::CellFailed {
                cell_id: self.cell_id.clone(),
                execution_order: self.execution_order,
                kind: e.kind(),
                message: e.to_string(),
                hint: e.hint().map(str::to_string),
            },
        }
    }
}

/// Drives code blocks to completion. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    broker: InputBroker,
    runner: TransientRunner,
    session: Mutex<Option<Arc<InterpreterSession>>>,
    execution_order: AtomicU64,
    updates: mpsc::UnboundedSender<CellUpdate>,
}

impl Orchestrator {
    /// Create an orchestrator and the stream of output updates it produces.
    pub fn new(config: Config, broker: InputBroker) -> (Self, mpsc::UnboundedReceiver<CellUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            runner: TransientRunner::new(config.clone()),
            config,
            broker,
            session: Mutex::new(None),
            execution_order: AtomicU64::new(0),
            updates,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn broker(&self) -> &InputBroker {
        &self.inner.broker
    }

    /// Run one block. Always yields exactly one report.
    pub async fn execute(&self, request: ExecutionRequest) -> CellReport {
        let execution_order = self.inner.execution_order.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = Arc::new(CellSink {
            cell_id: request.cell_id.clone(),
            view: tokio::sync::Mutex::new(OutputView::default()),
            broker: self.inner.broker.clone(),
            updates: self.inner.updates.clone(),
            settled: AtomicBool::new(false),
        });

        tracing::debug!(
            cell = %request.cell_id,
            language = %request.language,
            execution_order,
            "executing"
        );
        let outcome = self.run(&request, &sink).await;
        match &outcome {
            Ok(items) => sink.settle(Some(items.clone())).await,
            Err(e) => {
                if e.is_stopped() {
                    tracing::info!(cell = %request.cell_id, "execution stopped: {}", e);
                } else {
                    tracing::debug!(cell = %request.cell_id, "execution failed: {}", e);
                }
                sink.settle(None).await;
            }
        }

        CellReport {
            cell_id: request.cell_id,
            execution_order,
            outcome,
        }
    }

    async fn run(&self, request: &ExecutionRequest, sink: &Arc<CellSink>) -> Result<Vec<OutputItem>> {
        if request.readonly {
            return Ok(vec![OutputItem::Text(READONLY_NOTICE.to_string())]);
        }
        let language: Language = request.language.parse()?;

        let result = match (language.strategy(), request.stateless) {
            (Strategy::Persistent, false) => {
                let session = self.shared_session();
                session
                    .execute(request.source.clone(), sink.clone(), &request.abort)
                    .await
            }
            (Strategy::Persistent, true) => {
                let session = InterpreterSession::new(SessionConfig::from(&self.inner.config));
                let result = session
                    .execute(request.source.clone(), sink.clone(), &request.abort)
                    .await;
                session.shutdown().await;
                result
            }
            (Strategy::Transient, _) => {
                self.inner
                    .runner
                    .run(language, &request.source, sink.as_ref(), &request.abort)
                    .await
            }
        };

        let result = match result {
            Err(Error::Interrupted) if request.abort.is_aborted() => Err(Error::Cancelled),
            other => other,
        }?;
        Ok(output::final_items(&result))
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<InterpreterSession>>> {
        self.inner.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared_session(&self) -> Arc<InterpreterSession> {
        self.lock_session()
            .get_or_insert_with(|| {
                tracing::info!(python = %self.inner.config.python, "creating shared interpreter session");
                Arc::new(InterpreterSession::new(SessionConfig::from(&self.inner.config)))
            })
            .clone()
    }

    /// Interrupt whatever is running in the shared interpreter.
    pub fn interrupt(&self) {
        if let Some(session) = self.lock_session().as_ref() {
            session.interrupt();
        }
    }

    /// Discard the shared interpreter. The next block starts a fresh one.
    pub async fn restart(&self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            tracing::info!("restarting shared interpreter session");
            session.shutdown().await;
        }
    }

    /// Tear everything down. Pending input requests are cancelled.
    pub async fn dispose(&self) {
        self.restart().await;
        self.inner.broker.cancel_all("orchestrator disposed");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field(
                "execution_order",
                &self.inner.execution_order.load(Ordering::SeqCst),
            )
            .field("broker", &self.inner.broker)
            .finish()
    }
}

/// Sink that turns one block's progress into output replacements.
struct CellSink {
    cell_id: CellId,
    /// Output gate: every replacement is built and published under it.
    view: tokio::sync::Mutex<OutputView>,
    broker: InputBroker,
    updates: mpsc::UnboundedSender<CellUpdate>,
    /// Set once the terminal view is out; later progress is dropped.
    settled: AtomicBool,
}

impl CellSink {
    fn publish(&self, items: Vec<OutputItem>) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        let update = CellUpdate {
            cell_id: self.cell_id.clone(),
            items,
        };
        if self.updates.send(update).is_err() {
            tracing::trace!(cell = %self.cell_id, "no listener for output updates");
        }
    }

    /// Publish the terminal view: `items` on success, else the live text
    /// without any stale prompt.
    async fn settle(&self, items: Option<Vec<OutputItem>>) {
        let mut view = self.view.lock().await;
        view.set_prompt(None);
        self.publish(items.unwrap_or_else(|| view.items()));
        self.settled.store(true, Ordering::SeqCst);
    }
}

impl ExecutionSink for CellSink {
    fn on_display<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut view = self.view.lock().await;
            view.push_text(text);
            self.publish(view.items());
        })
    }

    fn on_input_request(
        &self,
        request_id: String,
        prompt: String,
    ) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            // Registered before the prompt is visible, so no response can
            // arrive for an unknown id.
            let pending = self.broker.register(request_id.clone());
            {
                let mut view = self.view.lock().await;
                view.set_prompt(Some(InputPrompt { prompt, request_id }));
                self.publish(view.items());
            }

            let answer = pending.wait().await;

            let mut view = self.view.lock().await;
            view.set_prompt(None);
            self.publish(view.items());
            answer
        })
    }
}
