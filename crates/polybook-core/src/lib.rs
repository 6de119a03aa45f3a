//! Core engine for polybook polyglot notebooks.
//!
//! This crate provides:
//! - Marker protocol shared with every running program
//! - Incremental stream demultiplexing of subprocess output
//! - One-shot compile-and-run execution for C, C++, Java and JavaScript
//! - Persistent Python interpreter sessions
//! - Input request brokering and per-block orchestration
//! - JSON wire messages for external UI surfaces

pub mod broker;
pub mod config;
pub mod error;
pub mod execute;
pub mod language;
pub mod markers;
pub mod orchestrator;
pub mod output;
pub mod protocol;
pub mod stream;

pub use broker::{InputBroker, PendingInput};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use execute::{
    AbortHandle, ExecutionResult, ExecutionSink, InterpreterSession, SessionConfig, SessionState,
    TransientRunner,
};
pub use language::{Language, Strategy};
pub use markers::CompletionMarker;
pub use orchestrator::{CellReport, ExecutionRequest, Orchestrator};
pub use output::{CellId, CellUpdate, ImageData, InputPrompt, OutputItem};
pub use protocol::{ClientMessage, ServerMessage};
pub use stream::{StreamDemux, StreamEvent, Utf8Decoder};
