//! Presentation-level outputs of a code block.

use serde::{Deserialize, Serialize};

use crate::execute::ExecutionResult;
use crate::markers;

/// Fixed text reported for read-only blocks.
pub const READONLY_NOTICE: &str = "Read-only code block. Execution skipped.";

/// Identifier of a code block, chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub mime: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// A pending prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPrompt {
    pub prompt: String,
    pub request_id: String,
}

/// One item of a block's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum OutputItem {
    Text(String),
    Image(ImageData),
    InputRequest(InputPrompt),
}

impl OutputItem {
    pub fn png(data: impl Into<String>) -> Self {
        OutputItem::Image(ImageData {
            mime: "image/png".to_string(),
            data: data.into(),
        })
    }
}

/// Replacement of a block's whole output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub cell_id: CellId,
    pub items: Vec<OutputItem>,
}

/// Live output of one running block.
#[derive(Debug, Default, Clone)]
pub struct OutputView {
    text: String,
    prompt: Option<InputPrompt>,
}

impl OutputView {
    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn set_prompt(&mut self, prompt: Option<InputPrompt>) {
        self.prompt = prompt;
    }

    pub fn items(&self) -> Vec<OutputItem> {
        let mut items = Vec::new();
        if !self.text.is_empty() {
            items.push(OutputItem::Text(self.text.clone()));
        }
        if let Some(prompt) = &self.prompt {
            items.push(OutputItem::InputRequest(prompt.clone()));
        }
        items
    }
}

/// Final outputs of a finished execution: its text, then every image.
pub fn final_items(result: &ExecutionResult) -> Vec<OutputItem> {
    let mut items = Vec::new();
    if !result.displayed.is_empty() {
        items.push(OutputItem::Text(result.displayed.clone()));
    }
    items.extend(markers::plot_payloads(&result.raw).into_iter().map(OutputItem::png));
    items
}
