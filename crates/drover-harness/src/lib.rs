//! drover-harness — lifecycle plumbing shared by the daemon loops:
//! cooperative shutdown, per-session stop tokens, and loop health tracking.

pub mod health;
pub mod shutdown;
