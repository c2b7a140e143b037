//! The execution engine: Event Bus (C1), State Store (C2), Pipeline (C6),
//! Conversation Driver (C7), Scheduler/Worker Pool (C8), and Result
//! Aggregator (C9). Everything here is constructed explicitly by the
//! caller (no global singletons — spec §9 redesign note) so the engine
//! stays embeddable and testable outside the CLI.

pub mod aggregator;
pub mod driver;
pub mod duplex;
pub mod event_bus;
pub mod pipeline;
pub mod scheduler;
pub mod state_store;

pub use aggregator::{ReportDetail, ReportIndex};
pub use event_bus::{EventBus, EventReceiver};
pub use scheduler::Scheduler;
pub use state_store::StateStore;
