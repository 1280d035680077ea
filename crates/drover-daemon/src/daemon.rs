//! The drover daemon: wires the store, bus, notifier, and LLM provider
//! into the named long-lived loops, and runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use drover_agents::context_builder::ContextBuilder;
use drover_agents::reviewer::Reviewer;
use drover_agents::runner::{AgentSpawner, ProcessSpawner, RunnerRegistry, RunnerSettings};
use drover_agents::summarizer::Summarizer;
use drover_agents::watchdog::Watchdog;
use drover_bridge::event_bus::EventBus;
use drover_bridge::notify::{route_reply, InboundOutcome, Notifier, NotifyError};
use drover_core::clock::{Clock, SystemClock};
use drover_core::config::Config;
use drover_core::types::DaemonState;
use drover_harness::health::HealthRegistry;
use drover_harness::shutdown::{ShutdownSignal, StopReason};
use drover_intelligence::llm::{AnthropicProvider, LlmConfig, LlmProvider};
use drover_store::Store;
use tracing::{error, info};

use crate::heartbeat::Heartbeat;
use crate::scheduler::{SchedulerCtx, TicketScheduler};

/// Loop intervals, overridable for tests.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub scheduler: Duration,
    pub reviewer: Duration,
    pub summarizer: Duration,
    pub watchdog: Duration,
    pub heartbeat: Duration,
}

impl DaemonIntervals {
    fn from_config(config: &Config) -> Self {
        Self {
            scheduler: Duration::from_secs(config.scheduler.tick_secs),
            reviewer: Duration::from_secs(config.scheduler.tick_secs),
            summarizer: Duration::from_secs(config.summarizer.interval_minutes * 60),
            watchdog: Duration::from_secs(config.watchdog.interval_minutes * 60),
            heartbeat: Duration::from_secs(30),
        }
    }
}

pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    bus: EventBus,
    runners: RunnerRegistry,
    shutdown: ShutdownSignal,
    health: Arc<HealthRegistry>,
    intervals: DaemonIntervals,
    scheduler: Arc<TicketScheduler>,
    reviewer: Reviewer,
    summarizer: Arc<Summarizer>,
    watchdog: Watchdog,
    notifier: Arc<Notifier>,
    provider: Arc<dyn LlmProvider>,
    fast_config: LlmConfig,
}

impl Daemon {
    /// Open the store from config and wire everything with the production
    /// provider and spawner.
    pub async fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store_path = expand_home(&config.store.path);
        if let Some(parent) = std::path::Path::new(&store_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let store = Arc::new(
            Store::new(&store_path, Arc::clone(&clock))
                .await
                .context("failed to open the drover database")?,
        );

        let api_key = std::env::var(&config.providers.anthropic_key_env).unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!(
                env = %config.providers.anthropic_key_env,
                "no API key in the environment, classifier calls will fail"
            );
        }
        let provider: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(api_key));
        let spawner: Arc<dyn AgentSpawner> = Arc::new(ProcessSpawner);
        Ok(Self::wire(config, store, clock, provider, spawner))
    }

    /// Assemble a daemon from explicit parts (tests swap in mocks here).
    pub fn wire(
        config: Config,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn LlmProvider>,
        spawner: Arc<dyn AgentSpawner>,
    ) -> Self {
        let bus = EventBus::new();
        let runners = RunnerRegistry::new();
        let notifier = Arc::new(Notifier::from_config(config.notify.clone()));
        let fast_config = LlmConfig::for_model(config.providers.fast_model.clone());

        let builder = Arc::new(ContextBuilder::new(
            config.general.global_rules_path.as_deref(),
            config.summarizer.map_ttl_hours,
            config.summarizer.context_token_target,
            Arc::clone(&clock),
        ));
        let summarizer = Arc::new(Summarizer::new(
            Arc::clone(&provider),
            fast_config.clone(),
            config.summarizer.token_threshold,
        ));
        let reviewer = Reviewer::new(
            Arc::clone(&provider),
            fast_config.clone(),
            Arc::clone(&clock),
            config.review.auto_review_delay_minutes,
            config.review.max_attempts,
            config.review.enforce_deadline.then_some(config.review.deadline_days),
        );
        let watchdog = Watchdog::new(
            Arc::clone(&provider),
            fast_config.clone(),
            config.watchdog.min_messages,
            config.watchdog.window,
        );

        let scheduler = Arc::new(TicketScheduler::new(Arc::new(SchedulerCtx {
            store: Arc::clone(&store),
            bus: bus.clone(),
            notifier: Arc::clone(&notifier),
            runners: runners.clone(),
            spawner,
            settings: RunnerSettings::from_config(&config.agent),
            builder,
            summarizer: Arc::clone(&summarizer),
            clock: Arc::clone(&clock),
            config: config.scheduler.clone(),
            providers: config.providers.clone(),
            review_delay: ChronoDuration::minutes(config.review.auto_review_delay_minutes as i64),
            summarize_threshold: config.summarizer.token_threshold,
        })));

        let intervals = DaemonIntervals::from_config(&config);
        Self {
            config,
            store,
            bus,
            runners,
            shutdown: ShutdownSignal::new(),
            health: Arc::new(HealthRegistry::new()),
            intervals,
            scheduler,
            reviewer,
            summarizer,
            watchdog,
            notifier,
            provider,
            fast_config,
        }
    }

    /// Route an inbound chat reply: `?` queries are answered synchronously,
    /// anything else lands as a user message — injected into the live
    /// runner when one exists, reopening the ticket otherwise.
    pub async fn handle_inbound(&self, text: &str) -> Result<InboundOutcome, NotifyError> {
        let outcome =
            route_reply(&self.store, self.provider.as_ref(), &self.fast_config, text).await?;
        if let InboundOutcome::UserMessage {
            ticket_id,
            ref content,
            live: true,
            ..
        } = outcome
        {
            if !self.runners.inject(ticket_id, content) {
                // The runner exited between routing and injection; reopen
                // so the next session picks the message up.
                self.store.cancel_review(ticket_id).await?;
                self.store
                    .transition_ticket(
                        ticket_id,
                        drover_core::types::TicketStatus::Open,
                        None,
                    )
                    .await
                    .ok();
            }
        }
        Ok(outcome)
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Run every loop until the shutdown signal fires (blocking).
    pub async fn run(&self) -> Result<()> {
        let heartbeat = Heartbeat::new(Arc::clone(&self.health));

        self.health.register("scheduler", self.intervals.scheduler);
        self.health.register("reviewer", self.intervals.reviewer);
        self.health.register("summarizer", self.intervals.summarizer);
        self.health.register("watchdog", self.intervals.watchdog);

        let mut scheduler_interval = tokio::time::interval(self.intervals.scheduler);
        let mut reviewer_interval = tokio::time::interval(self.intervals.reviewer);
        let mut summarizer_interval = tokio::time::interval(self.intervals.summarizer);
        let mut watchdog_interval = tokio::time::interval(self.intervals.watchdog);
        let mut heartbeat_interval = tokio::time::interval(self.intervals.heartbeat);

        // Consume the first immediate tick so the loops don't all fire at
        // t=0.
        scheduler_interval.tick().await;
        reviewer_interval.tick().await;
        summarizer_interval.tick().await;
        watchdog_interval.tick().await;
        heartbeat_interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            scheduler_secs = self.intervals.scheduler.as_secs(),
            summarizer_secs = self.intervals.summarizer.as_secs(),
            watchdog_secs = self.intervals.watchdog.as_secs(),
            "daemon loops starting"
        );
        self.store
            .update_daemon_status(DaemonState::Running, None)
            .await
            .ok();

        loop {
            tokio::select! {
                _ = scheduler_interval.tick() => {
                    match self.scheduler.tick().await {
                        Ok(report) => {
                            if report.dispatched > 0 {
                                info!(
                                    dispatched = report.dispatched,
                                    active = report.active_workers,
                                    "scheduler tick"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                    self.health.tick("scheduler");
                }
                _ = reviewer_interval.tick() => {
                    match self.reviewer.sweep(&self.store, &self.bus).await {
                        Ok(report) if report.due > 0 || report.deadline_closed > 0 => {
                            info!(
                                due = report.due,
                                auto_closed = report.auto_closed,
                                deadline_closed = report.deadline_closed,
                                "review sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "review sweep failed"),
                    }
                    self.health.tick("reviewer");
                }
                _ = summarizer_interval.tick() => {
                    match self.summarizer.sweep(&self.store).await {
                        Ok(report) if report.candidates > 0 => {
                            info!(
                                candidates = report.candidates,
                                extractions = report.extractions_created,
                                tokens_compressed = report.tokens_compressed,
                                "summarizer sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "summarizer sweep failed"),
                    }
                    self.health.tick("summarizer");
                }
                _ = watchdog_interval.tick() => {
                    match self
                        .watchdog
                        .sweep(&self.store, &self.bus, &self.notifier, &self.runners)
                        .await
                    {
                        Ok(report) if !report.stuck_ticket_ids.is_empty() => {
                            info!(stuck = report.stuck_ticket_ids.len(), "watchdog sweep");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "watchdog sweep failed"),
                    }
                    self.health.tick("watchdog");
                }
                _ = heartbeat_interval.tick() => {
                    if let Err(e) = heartbeat.beat(&self.store).await {
                        error!(error = %e, "heartbeat write failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping loops");
                    break;
                }
            }
        }

        // Cut every live session loose, wait for the workers to finalize
        // their tickets, then record the stop.
        self.runners.stop_all(StopReason::Shutdown);
        self.scheduler.drain().await;
        self.store
            .update_daemon_status(DaemonState::Stopped, None)
            .await
            .ok();
        info!("daemon stopped");
        Ok(())
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
