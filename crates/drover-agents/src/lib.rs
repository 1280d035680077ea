//! drover-agents — everything that touches one ticket's execution:
//! the subprocess runner, the prompt envelope builder, the permission
//! filter, and the three periodic inspectors (summarizer, reviewer,
//! watchdog).

pub mod context_builder;
pub mod events;
pub mod permission;
pub mod reviewer;
pub mod runner;
pub mod summarizer;
pub mod watchdog;
