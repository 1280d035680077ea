use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Last-tick tracking for the daemon's named long-lived loops.
///
/// Each loop calls [`HealthRegistry::tick`] once per iteration; the
/// heartbeat writer asks for loops that have missed twice their declared
/// interval and degrades the liveness record accordingly.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    loops: DashMap<&'static str, LoopHealth>,
}

#[derive(Debug, Clone, Copy)]
struct LoopHealth {
    interval: Duration,
    last_tick: Instant,
}

/// A loop that has not ticked within twice its declared interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLoop {
    pub name: &'static str,
    pub since: Duration,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a loop and its expected tick interval.
    pub fn register(&self, name: &'static str, interval: Duration) {
        self.loops.insert(
            name,
            LoopHealth {
                interval,
                last_tick: Instant::now(),
            },
        );
    }

    /// Record a completed iteration.
    pub fn tick(&self, name: &'static str) {
        if let Some(mut entry) = self.loops.get_mut(name) {
            entry.last_tick = Instant::now();
        } else {
            tracing::warn!(name, "tick for unregistered loop");
        }
    }

    /// Loops that have missed twice their interval.
    pub fn stale_loops(&self) -> Vec<StaleLoop> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in self.loops.iter() {
            let elapsed = now.duration_since(entry.last_tick);
            if elapsed > entry.interval * 2 {
                stale.push(StaleLoop {
                    name: *entry.key(),
                    since: elapsed,
                });
            }
        }
        stale.sort_by_key(|s| s.name);
        stale
    }

    pub fn is_healthy(&self) -> bool {
        self.stale_loops().is_empty()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }
}
