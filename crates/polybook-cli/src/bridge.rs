//! Bridge command implementation for polybook CLI.
//!
//! Speaks the JSON-lines protocol of [`polybook_core::protocol`] over
//! stdin/stdout, standing in for a notebook UI. Every execution runs as its
//! own task; input responses are routed through the shared broker.

use std::collections::HashMap;

use polybook_core::{
    AbortHandle, CellId, CellReport, ClientMessage, Config, ExecutionRequest, InputBroker,
    Orchestrator, ServerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;

/// Serve the bridge until `shutdown` or end of input.
pub async fn execute(config: Config) -> anyhow::Result<()> {
    let broker = InputBroker::new();
    let (orchestrator, mut updates) = Orchestrator::new(config, broker.clone());
    let (reports_tx, mut reports) = mpsc::unbounded_channel::<CellReport>();
    let mut bridge = Bridge {
        orchestrator,
        broker,
        reports: reports_tx,
        running: HashMap::new(),
        in_flight: 0,
        out: tokio::io::stdout(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("bridge ready");
    loop {
        // Updates first: a block's final update is queued before its report.
        tokio::select! {
            biased;
            Some(update) = updates.recv() => {
                bridge
                    .send(&ServerMessage::CellUpdate {
                        cell_id: update.cell_id,
                        outputs: update.items,
                    })
                    .await?;
            }
            Some(report) = reports.recv() => bridge.finish(report).await?,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !bridge.handle_line(&line).await? {
                    break;
                }
            }
        }
    }

    tracing::info!(in_flight = bridge.in_flight, "bridge shutting down");
    for abort in bridge.running.values() {
        abort.abort();
    }
    bridge.orchestrator.dispose().await;

    while bridge.in_flight > 0 {
        tokio::select! {
            biased;
            Some(update) = updates.recv() => {
                bridge
                    .send(&ServerMessage::CellUpdate {
                        cell_id: update.cell_id,
                        outputs: update.items,
                    })
                    .await?;
            }
            Some(report) = reports.recv() => bridge.finish(report).await?,
        }
    }
    while let Ok(update) = updates.try_recv() {
        bridge
            .send(&ServerMessage::CellUpdate {
                cell_id: update.cell_id,
                outputs: update.items,
            })
            .await?;
    }
    Ok(())
}

struct Bridge {
    orchestrator: Orchestrator,
    broker: InputBroker,
    reports: mpsc::UnboundedSender<CellReport>,
    /// Cancellation handles of running blocks.
    running: HashMap<CellId, AbortHandle>,
    in_flight: usize,
    out: Stdout,
}

impl Bridge {
    async fn send(&mut self, message: &ServerMessage) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.out.write_all(line.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn error(&mut self, message: impl Into<String>) -> anyhow::Result<()> {
        let message = message.into();
        tracing::debug!(%message, "client message rejected");
        self.send(&ServerMessage::Error { message }).await
    }

    async fn finish(&mut self, report: CellReport) -> anyhow::Result<()> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.running.remove(&report.cell_id);
        self.send(&report.to_message()).await
    }

    /// Handle one client line. Returns `false` when the client asked to stop.
    async fn handle_line(&mut self, line: &str) -> anyhow::Result<bool> {
        if line.trim().is_empty() {
            return Ok(true);
        }
        let message: ClientMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                self.error(format!("invalid message: {e}")).await?;
                return Ok(true);
            }
        };

        match message {
            ClientMessage::Execute {
                cell_id,
                language,
                source,
                stateless,
                readonly,
            } => {
                if self.running.contains_key(&cell_id) {
                    self.error(format!("cell {cell_id} is already running")).await?;
                    return Ok(true);
                }
                let abort = AbortHandle::new();
                self.running.insert(cell_id.clone(), abort.clone());
                self.in_flight += 1;

                let request = ExecutionRequest::new(cell_id, language, source)
                    .stateless(stateless)
                    .readonly(readonly)
                    .with_abort(abort);
                let orchestrator = self.orchestrator.clone();
                let reports = self.reports.clone();
                tokio::spawn(async move {
                    let report = orchestrator.execute(request).await;
                    let _ = reports.send(report);
                });
            }

            ClientMessage::InputResponse { request_id, value } => {
                if self.broker.resolve(request_id.as_deref(), value).is_none() {
                    self.error("no matching input request is pending").await?;
                }
            }

            ClientMessage::Cancel { cell_id } => match self.running.get(&cell_id) {
                Some(abort) => abort.abort(),
                None => self.error(format!("cell {cell_id} is not running")).await?,
            },

            ClientMessage::Interrupt => self.orchestrator.interrupt(),

            ClientMessage::Restart => self.orchestrator.restart().await,

            ClientMessage::Shutdown => return Ok(false),
        }
        Ok(true)
    }
}
