//! Execution engine for polybook code blocks.
//!
//! Two runners share one output protocol (see [`crate::markers`]):
//!
//! - **`TransientRunner`** - One subprocess per run. The source is written to
//!   a scratch directory, compiled if needed, and executed. Used for C, C++,
//!   Java and JavaScript.
//! - **`InterpreterSession`** - One long-lived Python process that keeps its
//!   globals between submissions. Submissions are queued and run one at a
//!   time.
//!
//! # Architecture
//!
//! ```text
//! TransientRunner
//!     │
//!     ├── ScratchDir (source + artifacts, removed on every path)
//!     ├── compile step (gcc / g++ / javac)
//!     └── run step
//!             │
//!             └── stdout/stderr ──► StreamDemux ──► ExecutionSink
//!
//! InterpreterSession (handle)
//!     │
//!     └── worker task (owns the process)
//!             │
//!             ├── preamble: input hook, render sink, run entry point
//!             ├── stdin: one line per submission
//!             └── kill for interruption, respawn on next submission
//! ```
//!
//! # Module Structure
//!
//! - `bootstrap` - Python preamble and submission lines
//! - `context` - Results, abort handles, sinks and cleanup scopes
//! - `kernel` - Persistent interpreter sessions
//! - `kill` - Process group spawning and termination
//! - `scratch` - Temporary artifact directories
//! - `source` - Input helper injection and Java entry points
//! - `transient` - One-shot subprocess runner

mod bootstrap;
mod context;
mod kernel;
mod kill;
mod scratch;
mod source;
mod transient;

pub use context::{AbortHandle, CleanupScope, ExecutionResult, ExecutionSink, NullSink};
pub use kernel::{InterpreterSession, SessionConfig, SessionState};
pub use scratch::ScratchDir;
pub use source::{PreparedSource, prepare};
pub use transient::{CANCELLED_INPUT, TransientRunner};
