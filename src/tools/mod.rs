//! Tools — the handler seam and the categorized registry.
//!
//! Concrete tools (file I/O, shell, search) live outside this crate and are
//! registered at startup. Each registration declares its [`ToolCategory`],
//! which is all the dispatcher needs to schedule it.

pub mod errors;
pub mod registry;
pub mod types;

pub use errors::ToolError;
pub use registry::{ToolRegistry, WAIT_FOR_USER};
pub use types::{
    required_param, Confirmer, OutputKind, ToolCategory, ToolContext, ToolHandler, ToolOutput,
    ToolSpec,
};
