//! Host-facing tools for the guardian: command execution on local and SSH
//! hosts, log reading, web search, and the knowledge file.
//!
//! The [`CommandRunner`] seam is what the control loop and metric collector
//! talk to; the [`Tool`] implementations expose the same capabilities to the
//! chat assistant.

mod error;
mod host_tools;
mod hosts;
mod knowledge;
mod runner;
mod search;
mod shell;
mod ssh;
mod traits;

pub use error::{ExecutionError, HostConfigError, Result, ToolError};
pub use host_tools::{LogSource, SystemLogsTool, TerminalCommandTool};
pub use hosts::{HostDescriptor, HostKind, HostRegistry, LOCAL_HOST};
pub use knowledge::{KnowledgeStore, SaveKnowledgeTool};
pub use runner::{CommandRunner, HostCommandRunner, RunnerSettings, outcome_text};
pub use search::{DuckDuckGoSearch, SearchEntry, WebSearch, WebSearchTool, format_results};
pub use traits::{RiskLevel, Tool, ToolSpec, optional_string, require_string, to_llm_tool_def};
