//! Tool Registry & Executor (spec §4.4): declares callable tools and
//! dispatches `local`/`http`/`mcp` invocations, enforcing the shared
//! `ToolPolicy` (round cap, per-turn call cap, blocklist, response size
//! cap) and tracking human-in-the-loop ("async tool") pending calls.

pub mod executor;
pub mod pending;
pub mod registry;

pub use executor::{LocalToolFn, ToolExecutor, ToolOutcome};
pub use pending::{PendingOutcome, PendingTool, PendingToolMap};
pub use registry::ToolRegistry;
