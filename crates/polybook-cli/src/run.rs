//! Run command implementation for polybook CLI.
//!
//! Executes one source file as a single code block. Display text streams to
//! stdout as it is produced; input requests are answered from stdin.

use std::collections::HashSet;
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::time::Instant;

use polybook_core::{
    AbortHandle, CellUpdate, Config, ExecutionRequest, InputBroker, Language, Orchestrator,
    OutputItem,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::colors;

/// Run a source file.
pub async fn execute(
    path: &Path,
    language: Option<&str>,
    stateless: bool,
    config: Config,
) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let source = std::fs::read_to_string(path)?;
    let language = match language {
        Some(tag) => tag.to_string(),
        None => infer_language(path)?.as_str().to_string(),
    };

    let start = Instant::now();
    let (orchestrator, mut updates) = Orchestrator::new(config, InputBroker::new());
    let abort = AbortHandle::new();
    let cell_id = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    let request = ExecutionRequest::new(cell_id.as_str(), language, source)
        .stateless(stateless)
        .with_abort(abort.clone());

    let mut task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(request).await })
    };

    let mut console = Console::new(orchestrator.broker().clone());
    let report = loop {
        tokio::select! {
            Some(update) = updates.recv() => console.show(&update).await?,
            joined = &mut task => break joined?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted by user");
                abort.abort();
            }
        }
    };
    while let Ok(update) = updates.try_recv() {
        console.show(&update).await?;
    }
    orchestrator.dispose().await;

    match report.outcome {
        Ok(items) => {
            let images: Vec<_> = items
                .iter()
                .filter_map(|item| match item {
                    OutputItem::Image(image) => Some(image),
                    _ => None,
                })
                .collect();
            for (index, image) in images.iter().enumerate() {
                eprintln!(
                    "{}[image {}: {}, {} bytes base64]{}",
                    colors::DIM,
                    index + 1,
                    image.mime,
                    image.data.len(),
                    colors::RESET
                );
            }
            eprintln!(
                "{}Completed{} {} (execution {}) in {:.2}s",
                colors::GREEN,
                colors::RESET,
                cell_id,
                report.execution_order,
                start.elapsed().as_secs_f64()
            );
            Ok(())
        }
        Err(e) => {
            if e.is_stopped() {
                eprintln!("{}Execution Cancelled{}", colors::YELLOW, colors::RESET);
            }
            Err(e.into())
        }
    }
}

fn infer_language(path: &Path) -> anyhow::Result<Language> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Language::from_extension)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Cannot infer the language of {}; pass --language",
                path.display()
            )
        })
}

/// Mirrors one block's output replacements onto the terminal.
struct Console {
    broker: InputBroker,
    stdin: Lines<BufReader<Stdin>>,
    /// Bytes of the block's text already on screen.
    printed: usize,
    answered: HashSet<String>,
    echo_input: bool,
}

impl Console {
    fn new(broker: InputBroker) -> Self {
        Self {
            broker,
            stdin: BufReader::new(tokio::io::stdin()).lines(),
            printed: 0,
            answered: HashSet::new(),
            echo_input: !std::io::stdin().is_terminal(),
        }
    }

    async fn show(&mut self, update: &CellUpdate) -> anyhow::Result<()> {
        for item in &update.items {
            match item {
                OutputItem::Text(text) => {
                    if let Some(fresh) = text.get(self.printed..)
                        && !fresh.is_empty()
                    {
                        print!("{fresh}");
                        self.printed = text.len();
                    }
                }
                OutputItem::InputRequest(prompt) => {
                    if self.answered.insert(prompt.request_id.clone()) {
                        self.answer(&prompt.request_id, &prompt.prompt).await?;
                    }
                }
                OutputItem::Image(_) => {}
            }
        }
        std::io::stdout().flush()?;
        Ok(())
    }

    /// Prompt on the terminal and deliver one line of stdin.
    async fn answer(&mut self, request_id: &str, prompt: &str) -> anyhow::Result<()> {
        print!("{prompt}");
        std::io::stdout().flush()?;

        // The block echoes `prompt + value` into its text; that part is
        // already on screen.
        match self.stdin.next_line().await? {
            Some(value) => {
                if self.echo_input {
                    println!("{value}");
                }
                self.printed += prompt.len() + value.len() + 1;
                self.broker.resolve(Some(request_id), value);
            }
            None => {
                self.printed += prompt.len();
                self.broker.cancel(request_id);
            }
        }
        Ok(())
    }
}
